//! Extent allocation
//!
//! Carves named, non-overlapping linear volumes out of a single backing
//! block device.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AllocationError, DmResult};
use crate::table::{LinearTarget, Table, Target};

/// A physical block device used as an allocation address space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Device node path
    pub path: String,
    /// Size in sectors
    pub size: u64,
}

impl BlockDevice {
    /// Create a new block device descriptor
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// A named, contiguous region of the backing device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Volume name
    pub name: String,
    /// Start sector on the backing device
    pub offset: u64,
    /// Length in sectors
    pub length: u64,
}

impl Extent {
    /// Get the end offset
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Check if sector falls within this extent
    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.offset && sector < self.end()
    }

    /// Check if this extent overlaps with a range
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.offset < end && self.end() > start
    }
}

/// Bump allocator over one backing device
///
/// Each volume is placed immediately after the previous one. Only the last
/// volume may be resized, so extents never overlap.
#[derive(Debug, Clone, Default)]
pub struct ExtentAllocator {
    backing: Option<BlockDevice>,
    extents: Vec<Extent>,
}

impl ExtentAllocator {
    /// Create an allocator with no backing device
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator over `dev`
    pub fn with_device(dev: BlockDevice) -> Self {
        Self {
            backing: Some(dev),
            extents: Vec::new(),
        }
    }

    /// Register the backing address space
    pub fn add_allocation_volume(&mut self, dev: BlockDevice) -> Result<(), AllocationError> {
        if let Some(existing) = &self.backing {
            return Err(AllocationError::AlreadyRegistered(existing.path.clone()));
        }
        debug!(path = %dev.path, size = dev.size, "registered allocation volume");
        self.backing = Some(dev);
        Ok(())
    }

    /// Backing device, if registered
    pub fn backing(&self) -> Option<&BlockDevice> {
        self.backing.as_ref()
    }

    /// Total sectors of the backing device
    pub fn capacity(&self) -> u64 {
        self.backing.as_ref().map_or(0, |b| b.size)
    }

    /// Sectors not yet reserved
    pub fn free_space(&self) -> u64 {
        self.capacity() - self.next_offset()
    }

    fn next_offset(&self) -> u64 {
        self.extents.last().map_or(0, Extent::end)
    }

    /// Reserve `length` sectors for a new volume
    pub fn add_volume(
        &mut self,
        name: impl Into<String>,
        length: u64,
    ) -> Result<&Extent, AllocationError> {
        let name = name.into();
        if self.backing.is_none() {
            return Err(AllocationError::NoAllocationVolume);
        }
        if length == 0 {
            return Err(AllocationError::ZeroLength(name));
        }
        if self.extent(&name).is_some() {
            return Err(AllocationError::DuplicateVolume(name));
        }

        let available = self.free_space();
        if length > available {
            return Err(AllocationError::InsufficientSpace {
                name,
                requested: length,
                available,
            });
        }

        let offset = self.next_offset();
        debug!(volume = %name, offset, length, "allocated extent");
        self.extents.push(Extent {
            name,
            offset,
            length,
        });
        Ok(&self.extents[self.extents.len() - 1])
    }

    /// Look up a volume by name
    pub fn extent(&self, name: &str) -> Option<&Extent> {
        self.extents.iter().find(|e| e.name == name)
    }

    /// All volumes in allocation order
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Linear table mapping the named volume onto the backing device
    pub fn table_for(&self, name: &str) -> DmResult<Table> {
        let backing = self
            .backing
            .as_ref()
            .ok_or(AllocationError::NoAllocationVolume)?;
        let extent = self
            .extent(name)
            .ok_or_else(|| AllocationError::UnknownVolume(name.to_string()))?;

        let target = Target::from_params(
            extent.length,
            &LinearTarget::new(backing.path.clone(), extent.offset),
        )?;
        Ok(Table::new(target))
    }

    /// Change the length of the most recently allocated volume
    pub fn resize(&mut self, name: &str, new_length: u64) -> Result<(), AllocationError> {
        let index = self
            .extents
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| AllocationError::UnknownVolume(name.to_string()))?;

        if let Some(next) = self.extents.get(index + 1) {
            return Err(AllocationError::NotTerminal {
                name: name.to_string(),
                next: next.name.clone(),
            });
        }
        if new_length == 0 {
            return Err(AllocationError::ZeroLength(name.to_string()));
        }

        let offset = self.extents[index].offset;
        let available = self.capacity() - offset;
        if new_length > available {
            return Err(AllocationError::InsufficientSpace {
                name: name.to_string(),
                requested: new_length,
                available,
            });
        }

        debug!(volume = %name, old = self.extents[index].length, new = new_length, "resized extent");
        self.extents[index].length = new_length;
        Ok(())
    }
}
