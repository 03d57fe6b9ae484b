// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Instant;

use crate::backing_store::BackingStore;
use crate::mapping::{self, Sharing};
use crate::{
    Error, GuestRam, NonMemoryState, Result, SharedWindow, SnapshotConfig, StateSerializer,
};

/// The single snapshot of a VM plus its shared window.
///
/// Every operation receives the guest RAM location read by the caller at
/// the start of the access and uses it for all mapping calls it issues.
pub struct SnapshotEngine {
    config: SnapshotConfig,
    backing: BackingStore,
    window: SharedWindow,
    saved: Option<NonMemoryState>,
}

impl SnapshotEngine {
    pub fn new(config: SnapshotConfig) -> Self {
        SnapshotEngine {
            backing: BackingStore::new(&config.snapshot_path),
            window: SharedWindow::new(&config.shared_path),
            saved: None,
            config,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn backing_store(&self) -> &BackingStore {
        &self.backing
    }

    pub fn shared_window(&self) -> &SharedWindow {
        &self.window
    }

    pub fn is_saved(&self) -> bool {
        self.saved.is_some()
    }

    /// Non-memory state captured by the last successful save.
    pub fn saved_state(&self) -> Option<&NonMemoryState> {
        self.saved.as_ref()
    }

    /// Saves guest RAM and the non-memory state, then leaves guest RAM as
    /// a private copy-on-write view of the saved image. Does nothing once
    /// a snapshot exists.
    ///
    /// If capturing the non-memory state fails, no snapshot exists
    /// afterwards but guest RAM stays on the private view of the image just
    /// written. Guest writes never reach that image, so saving again is
    /// safe.
    ///
    /// The image holds the guest's view of the shared window page, i.e. the
    /// shared memory file contents. The bytes the window displaced are
    /// dropped when guest RAM is remapped.
    pub fn save(&mut self, ram: &GuestRam, state: &mut dyn StateSerializer) -> Result<()> {
        if self.saved.is_some() {
            debug!("Snapshot already saved, ignoring save request");
            return Ok(());
        }

        let start = Instant::now();
        self.backing.save(ram)?;
        debug!(
            "Guest RAM written to {} in {:?}",
            self.backing.path().display(),
            start.elapsed()
        );

        self.restore_ram_only(ram)?;

        let captured = state.capture_state().map_err(Error::CaptureState)?;
        info!(
            "Snapshot saved: {:#x} bytes of guest RAM, {} bytes of state in {:?}",
            ram.len(),
            captured.len(),
            start.elapsed()
        );
        self.saved = Some(captured);
        Ok(())
    }

    /// Rewinds guest RAM and the non-memory state to the saved snapshot.
    pub fn restore(&mut self, ram: &GuestRam, state: &mut dyn StateSerializer) -> Result<()> {
        if self.saved.is_none() {
            return Err(Error::NotSaved);
        }

        let start = Instant::now();
        self.restore_ram_only(ram)?;

        let saved = self.saved.as_ref().ok_or(Error::NotSaved)?;
        state.apply_state(saved).map_err(Error::ApplyState)?;
        info!("Snapshot restored in {:?}", start.elapsed());
        Ok(())
    }

    /// Binds the shared window to `addr`, releasing any previous binding
    /// first. A rejected address leaves no window at all.
    pub fn set_shared_address(&mut self, ram: &GuestRam, addr: u64) -> Result<()> {
        self.window.deactivate(ram)?;
        self.window.activate(ram, addr)?;
        Ok(())
    }

    pub fn release_shared(&mut self, ram: &GuestRam) -> Result<()> {
        self.window.deactivate(ram)?;
        Ok(())
    }

    // Swaps the whole of guest RAM for a private mapping of the image. The
    // shared window must be gone while the RAM range is remapped and is
    // rebuilt at the same offset afterwards.
    fn restore_ram_only(&mut self, ram: &GuestRam) -> Result<()> {
        let image = self.backing.open_for_cow_restore(ram.len())?;
        let window = self.window.discard(ram)?;

        // SAFETY: `GuestRam` grants ownership of the range for the duration
        // of the operation and the image was checked to cover all of it.
        unsafe {
            mapping::unmap(ram.base(), ram.len()).map_err(Error::ReplaceRam)?;
            mapping::map_file_fixed(ram.base(), ram.len(), &image, Sharing::Private)
                .map_err(Error::ReplaceRam)?;
        }

        if let Some(offset) = window {
            self.window.activate(ram, offset)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::backing_store;
    use crate::test_util::{test_config, TestCpu, TestRam};
    use crate::{ErrorKind, SharedMailbox, PAGE_SIZE};

    fn setup(pages: usize) -> (TempDir, SnapshotEngine, TestRam) {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-engine").unwrap();
        let engine = SnapshotEngine::new(test_config(dir.as_path()));
        (dir, engine, TestRam::new(pages * PAGE_SIZE))
    }

    #[test]
    fn test_round_trip() {
        let (_dir, mut engine, ram) = setup(8);
        let mut cpu = TestCpu {
            registers: vec![1, 2, 3],
            ..Default::default()
        };
        ram.fill(|i| (i % 253) as u8);
        let m0 = ram.contents();

        engine.save(&ram.ram(), &mut cpu).unwrap();
        assert!(engine.is_saved());
        assert_eq!(ram.contents(), m0);

        for round in 0..3u8 {
            ram.fill(|i| (i as u8) ^ round ^ 0xff);
            cpu.registers = vec![round; 5];
            engine.restore(&ram.ram(), &mut cpu).unwrap();
            assert_eq!(ram.contents(), m0);
            assert_eq!(cpu.registers, vec![1, 2, 3]);
        }

        // Guest writes after a restore never reach the image.
        assert_eq!(fs::read(engine.backing_store().path()).unwrap(), m0);
    }

    #[test]
    fn test_save_is_idempotent() {
        let (_dir, mut engine, ram) = setup(4);
        let mut cpu = TestCpu {
            registers: vec![0xaa],
            ..Default::default()
        };
        ram.fill(|_| 0x10);
        engine.save(&ram.ram(), &mut cpu).unwrap();

        ram.fill(|_| 0x20);
        cpu.registers = vec![0xbb];
        engine.save(&ram.ram(), &mut cpu).unwrap();
        assert_eq!(engine.saved_state().unwrap().as_bytes(), &[0xaa]);
        assert_eq!(ram.contents(), vec![0x20; 4 * PAGE_SIZE]);

        engine.restore(&ram.ram(), &mut cpu).unwrap();
        assert_eq!(ram.contents(), vec![0x10; 4 * PAGE_SIZE]);
        assert_eq!(cpu.registers, vec![0xaa]);
    }

    #[test]
    fn test_restore_before_save_rejected() {
        let (_dir, mut engine, ram) = setup(4);
        let mut cpu = TestCpu::default();
        ram.fill(|_| 0x5c);
        engine.set_shared_address(&ram.ram(), 0x2000).unwrap();
        ram.write(0x2000, b"live");

        let err = engine.restore(&ram.ram(), &mut cpu).unwrap_err();
        assert!(matches!(err, Error::NotSaved));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!engine.backing_store().path().exists());
        assert_eq!(engine.shared_window().address(), Some(0x2000));
        assert_eq!(&ram.page(0x2000)[..4], b"live");
        assert!(ram.page(0x1000).iter().all(|b| *b == 0x5c));
    }

    #[test]
    fn test_shared_window_survives_restore() {
        let (dir, mut engine, ram) = setup(4);
        let mut cpu = TestCpu::default();
        ram.fill(|_| 0x01);
        engine.set_shared_address(&ram.ram(), 0x1000).unwrap();
        let mailbox = SharedMailbox::open(dir.as_path().join("snapshot_data")).unwrap();
        mailbox.write(0, b"first").unwrap();

        engine.save(&ram.ram(), &mut cpu).unwrap();
        assert_eq!(engine.shared_window().address(), Some(0x1000));

        ram.fill(|_| 0x02);
        mailbox.write(0, b"second").unwrap();
        engine.restore(&ram.ram(), &mut cpu).unwrap();

        assert_eq!(engine.shared_window().address(), Some(0x1000));
        assert_eq!(&ram.page(0x1000)[..6], b"second");
        for offset in [0, 0x2000, 0x3000] {
            assert!(ram.page(offset).iter().all(|b| *b == 0x01));
        }

        // The channel still works in both directions.
        mailbox.write(0x100, b"third").unwrap();
        assert_eq!(&ram.page(0x1000)[0x100..0x105], b"third");
        ram.write(0x1000 + 0x200, b"reply");
        let mut buf = [0u8; 5];
        mailbox.read(0x200, &mut buf).unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[test]
    fn test_released_window_not_recreated_by_restore() {
        let (_dir, mut engine, ram) = setup(4);
        let mut cpu = TestCpu::default();
        engine.set_shared_address(&ram.ram(), 0x3000).unwrap();
        engine.save(&ram.ram(), &mut cpu).unwrap();
        engine.release_shared(&ram.ram()).unwrap();

        engine.restore(&ram.ram(), &mut cpu).unwrap();
        assert!(!engine.shared_window().is_active());
    }

    #[test]
    fn test_set_shared_address_rejects_bad_address() {
        let (_dir, mut engine, ram) = setup(4);
        engine.set_shared_address(&ram.ram(), 0x1000).unwrap();

        for addr in [0x4000, 0x2800] {
            let err = engine.set_shared_address(&ram.ram(), addr).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
            assert!(!engine.shared_window().is_active());
        }

        engine.set_shared_address(&ram.ram(), 0x2000).unwrap();
        engine.set_shared_address(&ram.ram(), 0x3000).unwrap();
        assert_eq!(engine.shared_window().address(), Some(0x3000));
    }

    #[test]
    fn test_failed_capture_leaves_no_snapshot() {
        let (_dir, mut engine, ram) = setup(4);
        let mut cpu = TestCpu {
            registers: vec![7],
            fail_capture: true,
        };
        ram.fill(|i| (i / PAGE_SIZE) as u8);
        let before = ram.contents();
        engine.set_shared_address(&ram.ram(), 0x2000).unwrap();

        let err = engine.save(&ram.ram(), &mut cpu).unwrap_err();
        assert!(matches!(err, Error::CaptureState(_)));
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(!engine.is_saved());
        assert_eq!(engine.shared_window().address(), Some(0x2000));
        assert!(matches!(
            engine.restore(&ram.ram(), &mut cpu),
            Err(Error::NotSaved)
        ));

        // The window page now holds what the shared file held when the
        // image was written. The rest of guest RAM is unchanged and private
        // to the guest.
        let mut expected = before.clone();
        expected[0x2000..0x3000].fill(0);
        engine.release_shared(&ram.ram()).unwrap();
        assert_eq!(ram.contents(), expected);
        ram.write(0, &[0xff; 8]);
        assert_eq!(
            &fs::read(engine.backing_store().path()).unwrap()[..8],
            &before[..8]
        );

        // Retrying once the collaborator recovers gives a full snapshot.
        cpu.fail_capture = false;
        engine.save(&ram.ram(), &mut cpu).unwrap();
        ram.fill(|_| 0);
        engine.restore(&ram.ram(), &mut cpu).unwrap();
        expected[..8].fill(0xff);
        assert_eq!(ram.contents(), expected);
        assert_eq!(cpu.registers, vec![7]);
    }

    #[test]
    fn test_size_mismatch_rejected_before_remap() {
        let (_dir, mut engine, ram) = setup(4);
        let mut cpu = TestCpu::default();
        ram.fill(|_| 0x44);
        engine.set_shared_address(&ram.ram(), 0x1000).unwrap();
        engine.save(&ram.ram(), &mut cpu).unwrap();

        // Replace the image with a smaller one without truncating the file
        // guest RAM is mapped from.
        let path = engine.backing_store().path().to_owned();
        fs::remove_file(&path).unwrap();
        fs::write(&path, vec![0u8; 2 * PAGE_SIZE]).unwrap();

        ram.fill(|_| 0x55);
        let err = engine.restore(&ram.ram(), &mut cpu).unwrap_err();
        assert!(matches!(
            err,
            Error::BackingStore(backing_store::Error::SizeMismatch { .. })
        ));
        assert!(!err.is_fatal());
        assert_eq!(engine.shared_window().address(), Some(0x1000));
        assert_eq!(ram.contents(), vec![0x55; 4 * PAGE_SIZE]);
    }

    #[test]
    fn test_save_failure_leaves_state_untouched() {
        let dir = TempDir::new_with_prefix("/tmp/snapfuzz-engine").unwrap();
        let mut config = test_config(dir.as_path());
        config.snapshot_path = dir.as_path().join("missing").join("snapshot0");
        let mut engine = SnapshotEngine::new(config);
        let ram = TestRam::new(2 * PAGE_SIZE);
        let mut cpu = TestCpu::default();
        ram.fill(|_| 0x66);

        let err = engine.save(&ram.ram(), &mut cpu).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!engine.is_saved());
        ram.write(0, &[0x67]);
        assert_eq!(ram.page(0)[0], 0x67);
    }
}
