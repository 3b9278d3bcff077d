//! End-to-end protocol tests
//!
//! Drives the real host client against the firmware dispatcher over an
//! in-memory channel pair, with a simulated card reader and EEPROM on the
//! device side. The dispatcher runs on its own thread, exactly like the
//! firmware runs opposite the host in the field.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nfckey_core::card::{
    encode_record, first_block, FlagByte, DEFAULT_AUTH_KEY, FLAG_OFFSET, PAYLOAD_OFFSET,
};
use nfckey_core::device::sim::{SimCard, SimEeprom, SimReader};
use nfckey_core::device::{CardReader, Dispatcher};
use nfckey_core::keys::{pad_password, KeySegment};
use nfckey_core::protocol::{DeviceClient, MemoryChannel, ProtocolError};
use nfckey_core::session::{KeySession, SessionError};

/// Start a dispatcher thread and return the host client wired to it.
///
/// Dropping the client closes the channel, which ends the dispatcher loop.
fn spawn_device(reader: SimReader, eeprom: SimEeprom) -> (DeviceClient, JoinHandle<()>) {
    let (host, device) = MemoryChannel::duplex();
    let handle = thread::spawn(move || {
        let mut dispatcher = Dispatcher::new(reader, eeprom, device);
        dispatcher.run().expect("dispatcher failed");
    });
    (DeviceClient::new(Box::new(host)), handle)
}

/// Concatenate the three data blocks of the key sector
fn sector_record(card: &SimCard) -> Vec<u8> {
    let base = first_block(nfckey_core::card::KEY_SECTOR);
    (0..3).flat_map(|i| card.block(base + i)).collect()
}

#[test]
fn test_password_lifecycle() {
    let reader = SimReader::new();
    reader.present(SimCard::blank());
    let (mut client, device) = spawn_device(reader, SimEeprom::new());

    assert!(!client.query_password_protected().unwrap());

    let password = pad_password("s3cret").unwrap();
    assert!(client.create_admin_password(&password).unwrap());
    assert!(client.query_password_protected().unwrap());

    assert!(client.verify_admin_password(&password).unwrap());
    let wrong = pad_password("nope").unwrap();
    assert!(!client.verify_admin_password(&wrong).unwrap());

    // The historical host API reported the opposite polarity
    assert!(client.verify_admin_password_legacy(&wrong).unwrap());
    assert!(!client.verify_admin_password_legacy(&password).unwrap());

    drop(client);
    device.join().unwrap();
}

#[test]
fn test_single_card_write_then_recover() {
    let reader = SimReader::new();
    reader.present(SimCard::blank());
    let eeprom = SimEeprom::new();
    let (mut client, device) = spawn_device(reader.clone(), eeprom.clone());

    let segment_a = KeySegment::from_bytes([b'Q'; 32]);
    let segment_b = KeySegment::from_bytes([b'Z'; 32]);
    let mut swaps = 0;
    client
        .write_key_segments(&segment_a, &segment_b, false, &mut || swaps += 1)
        .unwrap();
    assert_eq!(swaps, 0);

    // Neither the card nor the EEPROM may hold plaintext key material
    let record = sector_record(&reader.current_card().unwrap());
    assert_ne!(
        &record[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 32],
        segment_a.as_bytes()
    );
    assert_ne!(&eeprom.dump()[32..64], segment_b.as_bytes());
    // Single-card mode: the flag byte is the segment B slot index
    assert_eq!(record[FLAG_OFFSET], 1);

    let (recovered_a, recovered_b, dual) = client.recover_key_segments(&mut || swaps += 1).unwrap();
    assert_eq!(swaps, 0);
    assert!(!dual);
    assert_eq!(recovered_a, segment_a);
    assert_eq!(recovered_b, segment_b);

    drop(client);
    device.join().unwrap();
}

#[test]
fn test_rewriting_same_key_reuses_slot() {
    let reader = SimReader::new();
    reader.present(SimCard::blank());
    let eeprom = SimEeprom::new();
    let (mut client, device) = spawn_device(reader, eeprom.clone());

    let segment_a = KeySegment::from_bytes([1u8; 32]);
    let segment_b = KeySegment::from_bytes([2u8; 32]);
    for _ in 0..2 {
        client
            .write_key_segments(&segment_a, &segment_b, false, &mut || {})
            .unwrap();
    }
    // The second write found its own content in slot 1; slot 2 stays free
    assert!(eeprom.dump()[64..96].iter().all(|&b| b == 0));

    drop(client);
    device.join().unwrap();
}

#[test]
fn test_dual_card_write_then_recover_either_order() {
    let reader = SimReader::new();
    reader.present(SimCard::blank());
    reader.present(SimCard::blank());
    let (mut client, device) = spawn_device(reader.clone(), SimEeprom::new());

    let segment_a = KeySegment::from_bytes([b'A'; 32]);
    let segment_b = KeySegment::from_bytes([b'B'; 32]);
    let mut swaps = 0;
    client
        .write_key_segments(&segment_a, &segment_b, true, &mut || swaps += 1)
        .unwrap();
    assert_eq!(swaps, 1);

    let card_a = reader.removed_cards().pop().unwrap();
    let card_b = reader.current_card().unwrap();

    // Recover with the cards presented A then B
    reader.present(card_a.clone());
    reader.present(card_b.clone());
    let (ra, rb, dual) = client.recover_key_segments(&mut || swaps += 1).unwrap();
    assert_eq!(swaps, 2);
    assert!(dual);
    assert_eq!(ra, segment_a);
    assert_eq!(rb, segment_b);

    // The flag byte distinguishes the halves, so B-first works too
    reader.present(card_b);
    reader.present(card_a);
    let (ra, rb, dual) = client.recover_key_segments(&mut || swaps += 1).unwrap();
    assert_eq!(swaps, 3);
    assert!(dual);
    assert_eq!(ra, segment_a);
    assert_eq!(rb, segment_b);

    drop(client);
    device.join().unwrap();
}

#[test]
fn test_reply_deadline_without_device() {
    let (host, _device) = MemoryChannel::duplex();
    let mut client = DeviceClient::new(Box::new(host));

    let start = Instant::now();
    let err = client.query_password_protected().unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout(_)));
    // The default deadline is two seconds
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(4));
}

#[test]
fn test_recovery_rejects_out_of_range_slot_index() {
    // A card is not authenticated data: a corrupted flag byte can carry a
    // slot index far past the EEPROM. Recovery must refuse it with a status
    // line instead of reading out of bounds.
    let reader = SimReader::new();
    reader.present(SimCard::blank());
    let mut writer = reader.clone();
    writer.wait_for_card().unwrap();
    let base = first_block(nfckey_core::card::KEY_SECTOR);
    writer.authenticate(base, &DEFAULT_AUTH_KEY).unwrap();
    let record = encode_record(&[0u8; 32], FlagByte::from_raw(0b0011_1111));
    for i in 0..3u8 {
        let mut block = [0u8; 16];
        block.copy_from_slice(&record[i as usize * 16..(i as usize + 1) * 16]);
        writer.write_block(base + i, &block).unwrap();
    }

    let (mut client, device) = spawn_device(reader, SimEeprom::new());
    client.set_timeout(Duration::from_millis(500));
    let err = client.recover_key_segments(&mut || {}).unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout(_)));

    // The dispatcher must survive the bad record and exit cleanly
    drop(client);
    device.join().unwrap();
}

#[test]
fn test_locked_card_times_out_recovery() {
    let reader = SimReader::new();
    reader.present(SimCard::locked());
    let (mut client, device) = spawn_device(reader, SimEeprom::new());
    client.set_timeout(Duration::from_millis(500));

    let err = client.recover_key_segments(&mut || {}).unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout(_)));

    drop(client);
    device.join().unwrap();
}

#[test]
fn test_session_password_gate() {
    let reader = SimReader::new();
    reader.present(SimCard::blank());
    let eeprom = SimEeprom::new();

    // First session sets the password; setting it counts as unlocking
    let (client, device) = spawn_device(reader.clone(), eeprom.clone());
    let mut session = KeySession::with_client(client);
    assert!(!session.is_password_protected().unwrap());
    session.set_admin_password("topsecret").unwrap();
    assert!(session.is_unlocked());
    drop(session);
    device.join().unwrap();

    // A fresh session against the same device starts locked
    let (client, device) = spawn_device(reader.clone(), eeprom.clone());
    let mut session = KeySession::with_client(client);
    assert!(matches!(
        session.recover_key(&mut || {}),
        Err(SessionError::Locked)
    ));
    assert!(!session.unlock("wrong").unwrap());
    assert!(!session.is_unlocked());
    assert!(session.unlock("topsecret").unwrap());

    let (wrote_a, wrote_b) = session.write_new_key(false, &mut || {}).unwrap();
    let (read_a, read_b, dual) = session.recover_key(&mut || {}).unwrap();
    assert!(!dual);
    assert_eq!(read_a, wrote_a);
    assert_eq!(read_b, wrote_b);

    drop(session);
    device.join().unwrap();
}

#[test]
fn test_session_backup_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.bak");

    let reader = SimReader::new();
    reader.present(SimCard::blank());
    let eeprom = SimEeprom::new();
    let (client, device) = spawn_device(reader.clone(), eeprom.clone());
    let mut session = KeySession::with_client(client);

    let (segment_a, segment_b) = session.write_new_key(false, &mut || {}).unwrap();
    session.export_backup(&path, "backup pw", &mut || {}).unwrap();
    drop(session);
    device.join().unwrap();

    // Restore onto a fresh device
    let fresh_reader = SimReader::new();
    fresh_reader.present(SimCard::blank());
    let fresh_eeprom = SimEeprom::new();
    let (client, device) = spawn_device(fresh_reader.clone(), fresh_eeprom.clone());
    let mut session = KeySession::with_client(client);
    session
        .import_backup(&path, "backup pw", false, &mut || {})
        .unwrap();
    let (read_a, read_b, _) = session.recover_key(&mut || {}).unwrap();
    assert_eq!(read_a, segment_a);
    assert_eq!(read_b, segment_b);

    drop(session);
    device.join().unwrap();
}
