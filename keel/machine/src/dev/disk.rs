//! Sector-addressed block device.

use crate::spinlock::SpinLock;

/// Size of a disk sector.
pub const SECTOR_SIZE: usize = 512;

/// A block device made of [`SECTOR_SIZE`]-byte sectors.
pub struct Disk {
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
}

impl Disk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0; SECTOR_SIZE]; sectors]),
        }
    }

    /// Number of sectors on the device.
    pub fn size(&self) -> usize {
        let sectors = self.sectors.lock();
        let n = sectors.len();
        sectors.unlock();
        n
    }

    /// Reads sector `sector` into `buf`.
    pub fn read(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock();
        let data = sectors.get(sector).copied();
        sectors.unlock();
        *buf = data.unwrap_or_else(|| panic!("Disk read beyond the end: sector {sector}"));
    }

    /// Writes `buf` to sector `sector`.
    pub fn write(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock();
        let in_range = match sectors.get_mut(sector) {
            Some(slot) => {
                *slot = *buf;
                true
            }
            None => false,
        };
        sectors.unlock();
        assert!(in_range, "Disk write beyond the end: sector {sector}");
    }
}
