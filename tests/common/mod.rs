//! Common utilities for tests

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Once};

use flogfs::{Error, FlashDevice, FlashEvent, FlogFs, Geometry, Result, SPARE_RECORD_SIZE};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr) => {
        println!("{}[test] {}{}", crate::common::ORANGE, $msg, crate::common::RESET)
    };
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// 32 blocks of 4 pages, 4 sectors of 64 bytes: 14 data slots, 896 payload bytes per block.
pub fn small_geometry() -> Geometry {
    Geometry::new(32, 4, 4, 64).unwrap()
}

/// 32 blocks of 16 pages, 4 sectors of 512 bytes.
pub fn large_geometry() -> Geometry {
    Geometry::new(32, 16, 4, 512).unwrap()
}

#[derive(Default)]
struct Shared {
    bad: BTreeSet<u32>,
    events: Vec<FlashEvent>,
    erases: Vec<u32>,
    failing: BTreeSet<u32>,
    failing_pages: BTreeSet<(u32, u32)>,
}

/// In-memory NAND: every byte starts erased, spare tables follow each page's data.
///
/// Clones made by `power_cycle` see the same bytes, like the chip after a reboot.
pub struct RamFlash {
    inner: Arc<Mutex<Vec<u8>>>,
    shared: Arc<Mutex<Shared>>,
    geometry: Geometry,
    open: Option<(u32, u32)>,
    rng: ChaCha20Rng,
}

impl RamFlash {
    pub fn new(geometry: Geometry) -> Self {
        Self::with_seed(geometry, 7)
    }

    pub fn with_seed(geometry: Geometry, seed: u64) -> Self {
        let inner = Arc::new(Mutex::new(vec![0xFFu8; geometry.device_size() as usize]));
        RamFlash {
            inner,
            shared: Arc::new(Mutex::new(Shared::default())),
            geometry,
            open: None,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// A new device handle over the same storage, as seen after a restart.
    pub fn power_cycle(&self) -> Self {
        RamFlash {
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&self.shared),
            geometry: self.geometry,
            open: None,
            rng: ChaCha20Rng::seed_from_u64(self.inner.lock().unwrap().len() as u64),
        }
    }

    /// Overwrites raw bytes, bypassing every check.
    pub fn poke(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.inner.lock().unwrap();
        data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    }

    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.inner.lock().unwrap();
        data[offset as usize..offset as usize + len].to_vec()
    }

    pub fn set_bad(&self, block: u32) {
        self.shared.lock().unwrap().bad.insert(block);
    }

    /// Makes every program and erase of `block` fail.
    pub fn fail_block(&self, block: u32) {
        self.shared.lock().unwrap().failing.insert(block);
    }

    /// Makes every program of one page fail; the rest of the block still works.
    pub fn fail_page(&self, block: u32, page: u32) {
        self.shared.lock().unwrap().failing_pages.insert((block, page));
    }

    pub fn events(&self) -> Vec<FlashEvent> {
        self.shared.lock().unwrap().events.clone()
    }

    pub fn erases(&self) -> Vec<u32> {
        self.shared.lock().unwrap().erases.clone()
    }

    fn current(&self) -> Result<(u32, u32)> {
        self.open.ok_or(Error::DeviceFailure { block: u32::MAX })
    }

    fn check_failing(&self, block: u32) -> Result<()> {
        if self.shared.lock().unwrap().failing.contains(&block) {
            return Err(Error::DeviceFailure { block });
        }
        Ok(())
    }

    fn check_program(&self, block: u32, page: u32) -> Result<()> {
        self.check_failing(block)?;
        if self.shared.lock().unwrap().failing_pages.contains(&(block, page)) {
            return Err(Error::DeviceFailure { block });
        }
        Ok(())
    }
}

impl FlashDevice for RamFlash {
    fn initialize(&mut self, geometry: &Geometry) -> Result<()> {
        if *geometry != self.geometry {
            return Err(Error::InvalidGeometry);
        }
        Ok(())
    }

    fn open_page(&mut self, block: u32, page: u32) -> Result<()> {
        if block >= self.geometry.number_of_blocks || page >= self.geometry.pages_per_block {
            return Err(Error::DeviceFailure { block });
        }
        self.open = Some((block, page));
        Ok(())
    }

    fn close_page(&mut self) {
        self.open = None;
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        self.check_failing(block)?;
        let start = self.geometry.page_offset(block, 0) as usize;
        let end = start + self.geometry.block_size() as usize;
        self.inner.lock().unwrap()[start..end].fill(0xFF);
        self.shared.lock().unwrap().erases.push(block);
        Ok(())
    }

    fn is_bad_block(&mut self, block: u32) -> Result<bool> {
        Ok(self.shared.lock().unwrap().bad.contains(&block))
    }

    fn mark_bad_block(&mut self, block: u32) -> Result<()> {
        self.shared.lock().unwrap().bad.insert(block);
        Ok(())
    }

    fn read_sector(&mut self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let (block, page) = self.current()?;
        let start = self.geometry.sector_offset(block, page, sector, offset) as usize;
        let data = self.inner.lock().unwrap();
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn read_spare(&mut self, sector: u32, buf: &mut [u8; SPARE_RECORD_SIZE]) -> Result<()> {
        let (block, page) = self.current()?;
        let start = self.geometry.spare_offset(block, page, sector) as usize;
        let data = self.inner.lock().unwrap();
        buf.copy_from_slice(&data[start..start + SPARE_RECORD_SIZE]);
        Ok(())
    }

    fn write_sector(&mut self, sector: u32, offset: u32, src: &[u8]) -> Result<()> {
        let (block, page) = self.current()?;
        self.check_program(block, page)?;
        let start = self.geometry.sector_offset(block, page, sector, offset) as usize;
        self.inner.lock().unwrap()[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn write_spare(&mut self, sector: u32, src: &[u8; SPARE_RECORD_SIZE]) -> Result<()> {
        let (block, page) = self.current()?;
        self.check_program(block, page)?;
        let start = self.geometry.spare_offset(block, page, sector) as usize;
        self.inner.lock().unwrap()[start..start + SPARE_RECORD_SIZE].copy_from_slice(src);
        Ok(())
    }

    fn random(&mut self, max: u32) -> u32 {
        self.rng.gen_range(0..max)
    }

    fn event(&mut self, event: FlashEvent) {
        self.shared.lock().unwrap().events.push(event);
    }
}

/// Formats and mounts a fresh in-memory device.
pub fn mounted(geometry: Geometry) -> (FlogFs<RamFlash>, RamFlash) {
    init_logger();
    let flash = RamFlash::new(geometry);
    let twin = flash.power_cycle();
    let mut fs = FlogFs::initialize(flash, geometry).unwrap();
    fs.format().unwrap();
    fs.mount().unwrap();
    (fs, twin)
}

/// Mounts whatever is on `flash` through a new device handle.
pub fn remount(flash: &RamFlash) -> FlogFs<RamFlash> {
    let mut fs = FlogFs::initialize(flash.power_cycle(), flash.geometry).unwrap();
    fs.mount().unwrap();
    fs
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Writes `data` in `chunk` sized pieces to a new file and closes it.
pub fn write_file(fs: &mut FlogFs<RamFlash>, name: &str, data: &[u8], chunk: usize) {
    let mut handle = fs.open_write(name).unwrap();
    for piece in data.chunks(chunk.max(1)) {
        assert_eq!(fs.write(&mut handle, piece).unwrap(), piece.len());
    }
    fs.close_write(handle).unwrap();
}

/// Reads a whole file with `chunk` sized reads.
pub fn read_file(fs: &mut FlogFs<RamFlash>, name: &str, chunk: usize) -> Vec<u8> {
    let mut handle = fs.open_read(name).unwrap();
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk.max(1)];
    loop {
        let n = fs.read(&mut handle, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    fs.close_read(handle).unwrap();
    out
}
