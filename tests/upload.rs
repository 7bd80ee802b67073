mod common;

use common::*;

use ecbm_loader::boot::{BLOCK_RETRIES, DEFAULT_BLOCK_SIZE, SETTLE_DELAY_MS};
use ecbm_loader::firmware::{FirmwareFile, Filler};
use ecbm_loader::{Bootloader, Error};

const AUTH: [u8; 16] = *b"bootloader-auth!";
const FW_KEY: [u8; 16] = *b"firmware-key-123";
const ADDR: u8 = 1;

fn device() -> SimDevice {
    let mut d = SimDevice::new(ADDR, AUTH);
    d.fw_key = FW_KEY;
    d
}

fn firmware(len: usize) -> FirmwareFile {
    let raw: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
    FirmwareFile::package("app", [1, 4, 2], &FW_KEY, "ecbm test phrase", raw, Filler::Ones).unwrap()
}

#[test]
fn construct_resets_and_reauthenticates() {
    let (mut ecbm, bus, delay) = setup(vec![device()]);

    let boot = Bootloader::new(&mut ecbm, ADDR, &AUTH).unwrap();
    assert_eq!(boot.address(), ADDR);
    assert_eq!(boot.bootloader_info().name, "sim-boot");

    assert!(*delay.total.borrow() >= SETTLE_DELAY_MS as u64);

    let mut bus = bus.borrow_mut();
    let d = bus.device(ADDR);
    assert_eq!(d.resets, 1);
    assert!(d.session.is_some());
    assert_eq!(ecbm.session_key(ADDR), d.session.as_ref());
}

#[test]
fn full_upload() {
    let (mut ecbm, bus, _) = setup(vec![device()]);
    let fw = firmware(1000);
    let info = fw.info().unwrap();

    let mut boot = Bootloader::new(&mut ecbm, ADDR, &AUTH).unwrap();

    let mut reports = vec![];
    boot.upload_firmware_with_progress(&info, &fw.test_phrase().unwrap(), &fw.data, DEFAULT_BLOCK_SIZE, |sent, total| {
        reports.push((sent, total))
    })
    .unwrap();

    assert_eq!(reports, vec![(256, 1000), (512, 1000), (768, 1000), (1000, 1000)]);

    {
        let mut bus = bus.borrow_mut();
        let d = bus.device(ADDR);
        assert_eq!(d.image, fw.data);
        assert_eq!(d.end, Some((fw.checksum, 1000)));

        let (name, version, phrase) = d.begin.clone().unwrap();
        assert_eq!(name, "app");
        assert_eq!(version, [1, 4, 2]);
        assert_eq!(phrase, fw.test_phrase().unwrap());

        assert!(d.block_attempts.values().all(|n| *n == 1));
    }

    let installed = boot.firmware_info().unwrap();
    assert_eq!(installed, info);

    boot.pick().unwrap();
}

#[test]
fn block_retried_until_answered() {
    let (mut ecbm, bus, delay) = setup(vec![device()]);
    let fw = firmware(600);

    bus.borrow_mut().device(ADDR).drop_blocks.insert(256, 2);

    let mut boot = Bootloader::new(&mut ecbm, ADDR, &AUTH).unwrap();
    let before = *delay.total.borrow();

    boot.upload_firmware(&fw.info().unwrap(), &fw.test_phrase().unwrap(), &fw.data, 256)
        .unwrap();

    let mut bus = bus.borrow_mut();
    let d = bus.device(ADDR);
    assert_eq!(d.block_attempts.get(&0), Some(&1));
    assert_eq!(d.block_attempts.get(&256), Some(&3));
    assert_eq!(d.block_attempts.get(&512), Some(&1));
    assert_eq!(d.image, fw.data);

    // Two block timeouts of 2500ms plus two 100ms pauses
    assert!(*delay.total.borrow() - before >= 2 * 2500 + 2 * 100);
}

#[test]
fn block_retried_after_write_failure() {
    let (mut ecbm, bus, delay) = setup(vec![device()]);
    let fw = firmware(600);

    let mut boot = Bootloader::new(&mut ecbm, ADDR, &AUTH).unwrap();

    // BOOT-BEGIN goes next, then the first block
    let start = bus.borrow().frames.len();
    bus.borrow_mut().fail_frames.insert(start + 1);
    let before = *delay.total.borrow();

    boot.upload_firmware(&fw.info().unwrap(), &fw.test_phrase().unwrap(), &fw.data, 256)
        .unwrap();

    let mut bus = bus.borrow_mut();

    // Begin, failed block, its repeat, two more blocks, end
    assert_eq!(bus.frames.len() - start, 6);
    assert_eq!(bus.frames[start + 1], bus.frames[start + 2]);

    let d = bus.device(ADDR);
    assert_eq!(d.block_attempts.get(&0), Some(&1));
    assert_eq!(d.image, fw.data);
    assert_eq!(d.end, Some((fw.checksum, 600)));

    // Only the retry pause, no response timeout was waited out
    assert!(*delay.total.borrow() - before < 2500);
}

#[test]
fn upload_abandoned_after_retries() {
    let (mut ecbm, bus, _) = setup(vec![device()]);
    let fw = firmware(600);

    bus.borrow_mut().device(ADDR).drop_blocks.insert(0, 100);

    let mut boot = Bootloader::new(&mut ecbm, ADDR, &AUTH).unwrap();
    let r = boot.upload_firmware(&fw.info().unwrap(), &fw.test_phrase().unwrap(), &fw.data, 256);
    assert_eq!(r, Err(Error::Timeout));

    let mut bus = bus.borrow_mut();
    let d = bus.device(ADDR);
    assert_eq!(d.block_attempts.get(&0), Some(&(BLOCK_RETRIES + 1)));
    assert_eq!(d.block_attempts.get(&256), None);
    assert!(d.end.is_none());
}

#[test]
fn invalid_images_rejected_before_io() {
    let (mut ecbm, bus, _) = setup(vec![device()]);
    let fw = firmware(64);
    let info = fw.info().unwrap();
    let phrase = fw.test_phrase().unwrap();

    let mut boot = Bootloader::new(&mut ecbm, ADDR, &AUTH).unwrap();
    let frames = bus.borrow().frames.len();

    assert_eq!(
        boot.upload_firmware(&info, &phrase, &[], 256),
        Err(Error::InvalidArgument("firmware is empty"))
    );
    assert_eq!(
        boot.upload_firmware(&info, &phrase, &fw.data[..12], 256),
        Err(Error::InvalidArgument("firmware length must be a multiple of 8"))
    );
    assert_eq!(
        boot.upload_firmware(&info, &phrase, &fw.data, 0),
        Err(Error::InvalidArgument("block size must be non-zero"))
    );

    // Chunks must fit a single frame
    let large = firmware(8192);
    assert_eq!(
        boot.upload_firmware(&large.info().unwrap(), &phrase, &large.data, 4096),
        Err(Error::InvalidArgument("block size too large"))
    );

    assert_eq!(bus.borrow().frames.len(), frames);
}

#[test]
fn checksum_mismatch_is_not_retried() {
    let (mut ecbm, bus, _) = setup(vec![device()]);
    let fw = firmware(64);
    let mut info = fw.info().unwrap();
    info.checksum ^= 1;

    let mut boot = Bootloader::new(&mut ecbm, ADDR, &AUTH).unwrap();
    let e = boot
        .upload_firmware(&info, &fw.test_phrase().unwrap(), &fw.data, 256)
        .unwrap_err();

    assert_eq!(e, Error::Application(16));
    assert_eq!(e.code(), -16);

    let mut bus = bus.borrow_mut();
    assert_eq!(bus.device(ADDR).app_checksum, 0);
}

#[test]
fn wrong_auth_key_aborts_construction() {
    let (mut ecbm, bus, _) = setup(vec![device()]);

    let r = Bootloader::new(&mut ecbm, ADDR, &FW_KEY);
    assert_eq!(r.err(), Some(Error::Timeout));

    // The encrypted reset was never understood
    assert_eq!(bus.borrow_mut().device(ADDR).resets, 0);
}

#[test]
fn missing_device_aborts_construction() {
    let (mut ecbm, _, _) = setup(vec![device()]);

    let r = Bootloader::new(&mut ecbm, 7, &AUTH);
    assert_eq!(r.err(), Some(Error::Timeout));
}
