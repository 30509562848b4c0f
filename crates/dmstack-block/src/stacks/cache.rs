//! Cache stack
//!
//! `md` and `ssd` live on the fast device and `origin` on the slow one.

use tracing::info;

use crate::config::CacheOptions;
use crate::device::Device;
use crate::error::{DescriptorError, DmResult};
use crate::extent::{BlockDevice, ExtentAllocator};
use crate::message::CacheMessage;
use crate::stack::{Stack, StackLayout, SupportDevices};
use crate::status::CacheStatus;
use crate::table::{CacheTarget, Table, Target};

/// Support volumes and geometry of a cache stack
#[derive(Debug, Clone)]
pub struct CacheLayout {
    options: CacheOptions,
    fast: ExtentAllocator,
    slow: ExtentAllocator,
}

impl CacheLayout {
    pub fn new(fast_dev: BlockDevice, slow_dev: BlockDevice, options: CacheOptions) -> DmResult<Self> {
        DescriptorError::check_block_size("cache", options.block_size)?;

        let mut fast = ExtentAllocator::with_device(fast_dev);
        fast.add_volume("md", options.metadata_size)?;
        fast.add_volume("ssd", options.cache_size)?;

        let mut slow = ExtentAllocator::with_device(slow_dev);
        slow.add_volume("origin", options.origin_size)?;

        Ok(Self {
            options,
            fast,
            slow,
        })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Number of cache blocks the `ssd` volume holds
    pub fn cache_blocks(&self) -> u64 {
        self.options.cache_size / self.options.block_size
    }

    pub fn cache_table(&self, md: &str, ssd: &str, origin: &str) -> DmResult<Table> {
        let mut params = CacheTarget::new(md, ssd, origin, self.options.block_size)
            .io_mode(self.options.io_mode)
            .policy(self.options.policy.clone());
        if self.options.metadata2 {
            params = params.metadata2();
        }
        Ok(Table::new(Target::from_params(self.options.origin_size, &params)?))
    }
}

impl StackLayout for CacheLayout {
    fn kind(&self) -> &'static str {
        "cache"
    }

    fn support_tables(&self) -> DmResult<Vec<(&'static str, Table)>> {
        Ok(vec![
            ("md", self.fast.table_for("md")?),
            ("ssd", self.fast.table_for("ssd")?),
            ("origin", self.slow.table_for("origin")?),
        ])
    }

    fn format_role(&self) -> Option<&'static str> {
        self.options.format.then_some("md")
    }

    fn top_level_table(&self, support: &SupportDevices) -> DmResult<Table> {
        self.cache_table(
            &support.path("md")?,
            &support.path("ssd")?,
            &support.path("origin")?,
        )
    }
}

pub type CacheStack = Stack<CacheLayout>;

impl Stack<CacheLayout> {
    pub fn set_migration_threshold(&self, cache: &Device, sectors: u64) -> DmResult<String> {
        cache.send(CacheMessage::migration_threshold(sectors))
    }

    /// Set a policy tunable such as `sequential_threshold`
    pub fn set_policy_arg(&self, cache: &Device, key: &str, value: u64) -> DmResult<String> {
        cache.send(CacheMessage::new(key, value))
    }

    /// Block until writeback has emptied the dirty set
    pub fn wait_for_all_clean(&self, cache: &Device) -> DmResult<CacheStatus> {
        let status = self.wait_for(cache, CacheStatus::is_clean)?;
        info!(device = %cache.name(), "cache clean");
        Ok(status)
    }
}
