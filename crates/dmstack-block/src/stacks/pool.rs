//! Thin-pool stack
//!
//! Data and metadata volumes share one device, with metadata last so it can
//! grow in place under a live pool. Thin volumes are provisioned
//! from the live pool with [`Stack::create_thin`] and mapped with
//! [`Stack::with_new_thin`].

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::PoolOptions;
use crate::device::{Device, DeviceSet, device_name, finish_scope};
use crate::error::{DescriptorError, DmError, DmResult};
use crate::extent::{BlockDevice, ExtentAllocator};
use crate::message::PoolMessage;
use crate::stack::{MetadataLayout, Stack, StackLayout, SupportDevices};
use crate::status::{DeviceStatus, ThinPoolStatus};
use crate::table::{Table, Target, ThinPoolTarget, ThinTarget};

/// Support volumes and geometry of a thin-pool stack
#[derive(Debug)]
pub struct PoolLayout {
    options: PoolOptions,
    alloc: Mutex<ExtentAllocator>,
}

impl PoolLayout {
    pub fn new(dev: BlockDevice, options: PoolOptions) -> DmResult<Self> {
        DescriptorError::check_block_size("thin-pool", options.block_size)?;

        let mut alloc = ExtentAllocator::with_device(dev);
        alloc.add_volume("data", options.data_size)?;
        alloc.add_volume("md", options.metadata_size)?;
        Ok(Self {
            options,
            alloc: Mutex::new(alloc),
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Data blocks in the pool
    pub fn data_blocks(&self) -> u64 {
        self.options.data_size / self.options.block_size
    }

    pub fn pool_table(&self, md: &str, data: &str) -> DmResult<Table> {
        let o = &self.options;
        let params = ThinPoolTarget {
            zero: o.zero,
            discard: o.discard,
            discard_passdown: o.discard_passdown,
            read_only: o.read_only,
            error_if_no_space: o.error_if_no_space,
            ..ThinPoolTarget::new(md, data, o.block_size, o.low_water_mark)
        };
        Ok(Table::new(Target::from_params(o.data_size, &params)?))
    }
}

impl StackLayout for PoolLayout {
    fn kind(&self) -> &'static str {
        "pool"
    }

    fn support_tables(&self) -> DmResult<Vec<(&'static str, Table)>> {
        Ok(vec![
            ("md", self.metadata_table()?),
            ("data", self.alloc.lock().table_for("data")?),
        ])
    }

    fn format_role(&self) -> Option<&'static str> {
        self.options.format.then_some("md")
    }

    fn top_level_table(&self, support: &SupportDevices) -> DmResult<Table> {
        self.pool_table(&support.path("md")?, &support.path("data")?)
    }
}

impl MetadataLayout for PoolLayout {
    fn metadata_size(&self) -> u64 {
        self.alloc.lock().extent("md").map_or(0, |e| e.length)
    }

    fn resize_metadata(&self, new_size: u64) -> DmResult<()> {
        Ok(self.alloc.lock().resize("md", new_size)?)
    }

    fn metadata_table(&self) -> DmResult<Table> {
        self.alloc.lock().table_for("md")
    }
}

pub type PoolStack = Stack<PoolLayout>;

impl Stack<PoolLayout> {
    pub fn create_thin(&self, pool: &Device, id: u32) -> DmResult<()> {
        pool.send(PoolMessage::CreateThin(id))?;
        debug!(pool = %pool.name(), id, "created thin device");
        Ok(())
    }

    /// Snapshot thin device `origin` as `id`
    ///
    /// The origin must not be mapped or must be paused for the duration.
    pub fn create_snap(&self, pool: &Device, id: u32, origin: u32) -> DmResult<()> {
        pool.send(PoolMessage::CreateSnap { id, origin })?;
        debug!(pool = %pool.name(), id, origin, "created snapshot");
        Ok(())
    }

    pub fn delete_thin(&self, pool: &Device, id: u32) -> DmResult<()> {
        pool.send(PoolMessage::Delete(id)).map(drop)
    }

    pub fn set_transaction_id(&self, pool: &Device, old: u64, new: u64) -> DmResult<()> {
        pool.send(PoolMessage::SetTransactionId { old, new }).map(drop)
    }

    pub fn reserve_metadata_snap(&self, pool: &Device) -> DmResult<()> {
        pool.send(PoolMessage::ReserveMetadataSnap).map(drop)
    }

    pub fn release_metadata_snap(&self, pool: &Device) -> DmResult<()> {
        pool.send(PoolMessage::ReleaseMetadataSnap).map(drop)
    }

    pub fn pool_status(&self, pool: &Device) -> DmResult<ThinPoolStatus> {
        match pool.status::<ThinPoolStatus>()? {
            DeviceStatus::Working(status) => Ok(status),
            DeviceStatus::Failed(kind) => Err(DmError::TargetFailed {
                device: pool.name().to_string(),
                kind,
            }),
        }
    }

    /// Map existing thin device `id` of `size` sectors around `body`
    pub fn with_thin<T>(
        &self,
        pool: &Device,
        size: u64,
        id: u32,
        body: impl FnOnce(&Device) -> DmResult<T>,
    ) -> DmResult<T> {
        let table = Table::new(Target::from_params(size, &ThinTarget::new(pool.path(), id))?);
        let mut set = DeviceSet::new(self.control().clone());
        set.activate(device_name(pool.name(), &format!("thin{id}")), table)?;
        let result = body(&set.devices()[0]);
        finish_scope(set, result)
    }

    /// Provision thin device `id` and map it around `body`
    ///
    /// The thin device is left provisioned in the pool afterwards.
    pub fn with_new_thin<T>(
        &self,
        pool: &Device,
        size: u64,
        id: u32,
        body: impl FnOnce(&Device) -> DmResult<T>,
    ) -> DmResult<T> {
        self.create_thin(pool, id)?;
        info!(pool = %pool.name(), id, size, "mapping new thin device");
        self.with_thin(pool, size, id, body)
    }
}
