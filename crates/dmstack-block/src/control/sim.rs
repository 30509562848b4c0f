//! In-process device-mapper model
//!
//! Enough of the kernel's behaviour to exercise stacks without root:
//! table validation, device-in-use checks on removal, metadata that
//! survives reactivation until its header is zeroed, clone hydration and
//! cache writeback that advance on each status query, and one-shot faults.

use std::collections::{BTreeMap, HashMap, HashSet};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ControlError, ParseError, ProcessError};
use crate::process::{CommandSpec, ProcessOutput, ProcessRunner};
use crate::status::{FailureKind, StatusCursor};
use crate::table::{Table, Target};
use crate::units::div_up;

const DEV_DIR: &str = "/dev/mapper";

/// Regions hydrated per status query unless changed
pub const DEFAULT_HYDRATION_STEP: u64 = 64;

const CLONE_MIN_REGION: u64 = 8;
const CLONE_MAX_REGION: u64 = 1 << 21;
const MD_BLOCK_SECTORS: u64 = 8;

/// Observable control plane activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Create(String),
    Remove(String),
    Suspend(String),
    Resume(String),
    Load(String),
    Message { device: String, message: String },
    Wipe { path: String, sectors: u64 },
}

type MetaKey = (String, u64);

#[derive(Debug, Clone)]
enum Metadata {
    Clone {
        region_size: u64,
        size: u64,
        hydrated: u64,
    },
    Cache {
        block_size: u64,
        dirty: u64,
    },
    Pool {
        block_size: u64,
        transaction_id: u64,
        thins: BTreeMap<u32, Option<u32>>,
        held_root: Option<u64>,
    },
}

impl Metadata {
    fn kind(&self) -> &'static str {
        match self {
            Metadata::Clone { .. } => "clone",
            Metadata::Cache { .. } => "cache",
            Metadata::Pool { .. } => "thin-pool",
        }
    }
}

#[derive(Debug, Clone)]
struct CloneState {
    md: MetaKey,
    md_total: u64,
    nr_regions: u64,
    region_size: u64,
    hydration: bool,
    discard_passdown: bool,
    threshold: u64,
    batch_size: u64,
}

#[derive(Debug, Clone)]
struct CacheState {
    md: MetaKey,
    md_total: u64,
    block_size: u64,
    cache_blocks: u64,
    features: Vec<String>,
    migration_threshold: u64,
    policy: String,
    policy_args: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct PoolState {
    md: MetaKey,
    md_total: u64,
    data_blocks: u64,
    low_water_mark: u64,
    read_only: bool,
    discard_passdown: bool,
    error_if_no_space: bool,
}

#[derive(Debug, Clone)]
enum TargetState {
    Linear,
    Clone(CloneState),
    Cache(CacheState),
    Pool(PoolState),
    Thin,
    Plain,
}

#[derive(Debug, Clone)]
struct SimTarget {
    target_type: String,
    length: u64,
    state: TargetState,
}

impl SimTarget {
    fn refresh_md_total(&mut self, fresh: &SimTarget) {
        match (&mut self.state, &fresh.state) {
            (TargetState::Clone(live), TargetState::Clone(f)) => live.md_total = f.md_total,
            (TargetState::Cache(live), TargetState::Cache(f)) => live.md_total = f.md_total,
            (TargetState::Pool(live), TargetState::Pool(f)) => live.md_total = f.md_total,
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
struct SimDevice {
    table: Table,
    targets: Vec<SimTarget>,
    pending: Option<(Table, Vec<SimTarget>)>,
    suspended: bool,
}

#[derive(Debug, Default)]
struct SimState {
    devices: BTreeMap<String, SimDevice>,
    metadata: HashMap<MetaKey, Metadata>,
    events: Vec<SimEvent>,
    reject_create: HashMap<String, String>,
    reject_load: Option<String>,
    reject_message: Option<String>,
    failed: HashMap<String, FailureKind>,
    hydration_step: u64,
}

/// Simulated kernel control plane
#[derive(Debug)]
pub struct SimControlPlane {
    backing: DashMap<String, u64>,
    state: Mutex<SimState>,
}

impl Default for SimControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(err: ParseError) -> ControlError {
    ControlError::rejected(err.to_string())
}

impl SimControlPlane {
    pub fn new() -> Self {
        Self {
            backing: DashMap::new(),
            state: Mutex::new(SimState {
                hydration_step: DEFAULT_HYDRATION_STEP,
                ..SimState::default()
            }),
        }
    }

    /// Register a physical device
    pub fn add_device(&self, path: impl Into<String>, size: u64) {
        self.backing.insert(path.into(), size);
    }

    /// Regions hydrated per status query
    pub fn set_hydration_step(&self, regions: u64) {
        self.state.lock().hydration_step = regions.max(1);
    }

    /// Fail the next create containing a target of this type
    pub fn reject_next_create(&self, target_type: impl Into<String>, reason: impl Into<String>) {
        self.state
            .lock()
            .reject_create
            .insert(target_type.into(), reason.into());
    }

    /// Fail the next table load
    pub fn reject_next_load(&self, reason: impl Into<String>) {
        self.state.lock().reject_load = Some(reason.into());
    }

    /// Fail the next message
    pub fn reject_next_message(&self, reason: impl Into<String>) {
        self.state.lock().reject_message = Some(reason.into());
    }

    /// Make a device report a failure sentinel from now on
    pub fn fail_device(&self, name: impl Into<String>, kind: FailureKind) {
        self.state.lock().failed.insert(name.into(), kind);
    }

    /// Mark `dirty` blocks on the cache device `name`
    pub fn set_cache_dirty(&self, name: &str, dirty: u64) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        let key = state
            .devices
            .get(name)
            .and_then(|d| {
                d.targets.iter().find_map(|t| match &t.state {
                    TargetState::Cache(c) => Some(c.md.clone()),
                    _ => None,
                })
            })
            .ok_or_else(|| ControlError::not_found(format!("no cache device {name}")))?;
        if let Some(Metadata::Cache { dirty: d, .. }) = state.metadata.get_mut(&key) {
            *d = dirty;
        }
        Ok(())
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Names of live devices
    pub fn device_names(&self) -> Vec<String> {
        self.state.lock().devices.keys().cloned().collect()
    }

    pub fn is_suspended(&self, name: &str) -> Option<bool> {
        self.state.lock().devices.get(name).map(|d| d.suspended)
    }

    /// Live table of a device
    pub fn table(&self, name: &str) -> Option<Table> {
        self.state.lock().devices.get(name).map(|d| d.table.clone())
    }

    fn size_of(&self, state: &SimState, path: &str) -> Option<u64> {
        if let Some(size) = self.backing.get(path) {
            return Some(*size);
        }
        path.strip_prefix(DEV_DIR)
            .and_then(|n| n.strip_prefix('/'))
            .and_then(|n| state.devices.get(n))
            .map(|d| d.table.size())
    }

    /// Physical location of `path` through stacked linear mappings
    fn resolve(&self, state: &SimState, path: &str, offset: u64) -> MetaKey {
        let dev = path
            .strip_prefix(DEV_DIR)
            .and_then(|n| n.strip_prefix('/'))
            .and_then(|n| state.devices.get(n));

        match dev.map(|d| d.table.targets()) {
            Some([only]) if only.target_type() == "linear" => {
                let inner = only.args()[1].parse::<u64>().unwrap_or(0);
                self.resolve(state, &only.args()[0], inner + offset)
            }
            _ => (path.to_string(), offset),
        }
    }

    fn require_size(&self, state: &SimState, path: &str) -> Result<u64, ControlError> {
        self.size_of(state, path)
            .ok_or_else(|| ControlError::rejected(format!("unknown device {path}")))
    }

    fn check_metadata(
        &self,
        state: &SimState,
        key: &MetaKey,
        expected: &Metadata,
    ) -> Result<(), ControlError> {
        let Some(existing) = state.metadata.get(key) else {
            return Ok(());
        };
        match (existing, expected) {
            (
                Metadata::Clone {
                    region_size: r,
                    size: s,
                    ..
                },
                Metadata::Clone {
                    region_size, size, ..
                },
            ) => {
                if r != region_size {
                    return Err(ControlError::incompatible(format!(
                        "region size mismatch: metadata has {r}, table has {region_size}"
                    )));
                }
                if s != size {
                    return Err(ControlError::incompatible(format!(
                        "target size mismatch: metadata has {s}, table has {size}"
                    )));
                }
                Ok(())
            }
            (Metadata::Cache { block_size: b, .. }, Metadata::Cache { block_size, .. })
            | (Metadata::Pool { block_size: b, .. }, Metadata::Pool { block_size, .. }) => {
                if b != block_size {
                    return Err(ControlError::incompatible(format!(
                        "block size mismatch: metadata has {b}, table has {block_size}"
                    )));
                }
                Ok(())
            }
            (existing, expected) => Err(ControlError::incompatible(format!(
                "metadata holds {} superblock, table wants {}",
                existing.kind(),
                expected.kind()
            ))),
        }
    }

    fn validate(
        &self,
        state: &SimState,
        table: &Table,
    ) -> Result<(Vec<SimTarget>, Vec<(MetaKey, Metadata)>), ControlError> {
        let mut targets = Vec::new();
        let mut bindings = Vec::new();
        for target in table.targets() {
            let (sim, binding) = self.validate_target(state, target)?;
            targets.push(sim);
            bindings.extend(binding);
        }
        Ok((targets, bindings))
    }

    fn validate_target(
        &self,
        state: &SimState,
        target: &Target,
    ) -> Result<(SimTarget, Option<(MetaKey, Metadata)>), ControlError> {
        let length = target.length();
        let joined = target.args().join(" ");
        let mut c = StatusCursor::new(&joined);

        let (target_state, binding) = match target.target_type() {
            "linear" => {
                let dev = c.take_token("device").map_err(rejected)?;
                let offset = c.take_int("offset").map_err(rejected)?;
                let size = self.require_size(state, dev)?;
                if offset + length > size {
                    return Err(ControlError::rejected(format!(
                        "linear target extends beyond end of {dev}"
                    )));
                }
                (TargetState::Linear, None)
            }
            "clone" => self.validate_clone(state, &mut c, length)?,
            "cache" => self.validate_cache(state, &mut c, length)?,
            "thin-pool" => self.validate_pool(state, &mut c, length)?,
            "thin" => {
                let pool = c.take_token("pool device").map_err(rejected)?;
                let id = c.take_int("device id").map_err(rejected)?;
                let pool_state = pool
                    .strip_prefix(DEV_DIR)
                    .and_then(|n| n.strip_prefix('/'))
                    .and_then(|n| state.devices.get(n))
                    .and_then(|d| {
                        d.targets.iter().find_map(|t| match &t.state {
                            TargetState::Pool(p) => Some(p),
                            _ => None,
                        })
                    })
                    .ok_or_else(|| ControlError::rejected(format!("{pool} is not a thin pool")))?;
                let known = matches!(
                    state.metadata.get(&pool_state.md),
                    Some(Metadata::Pool { thins, .. }) if thins.contains_key(&(id as u32))
                );
                if !known {
                    return Err(ControlError::rejected(format!("unknown thin device {id}")));
                }
                if !c.is_empty() {
                    let origin = c.take_token("external origin").map_err(rejected)?;
                    self.require_size(state, origin)?;
                }
                (TargetState::Thin, None)
            }
            "error" | "zero" => (TargetState::Plain, None),
            other => {
                return Err(ControlError::rejected(format!("unknown target type {other}")));
            }
        };
        c.finish("table").map_err(rejected)?;

        Ok((
            SimTarget {
                target_type: target.target_type().to_string(),
                length,
                state: target_state,
            },
            binding,
        ))
    }

    fn validate_clone(
        &self,
        state: &SimState,
        c: &mut StatusCursor<'_>,
        length: u64,
    ) -> Result<(TargetState, Option<(MetaKey, Metadata)>), ControlError> {
        let md = c.take_token("metadata device").map_err(rejected)?;
        let dest = c.take_token("destination device").map_err(rejected)?;
        let source = c.take_token("source device").map_err(rejected)?;
        let region_size = c.take_int("region size").map_err(rejected)?;
        let features = c.take_counted_list("features").map_err(rejected)?;
        let core_args = if c.is_empty() {
            Vec::new()
        } else {
            c.take_counted_pairs("core args").map_err(rejected)?
        };

        if !region_size.is_power_of_two()
            || !(CLONE_MIN_REGION..=CLONE_MAX_REGION).contains(&region_size)
        {
            return Err(ControlError::rejected(format!(
                "invalid region size {region_size}"
            )));
        }

        let md_size = self.require_size(state, md)?;
        for dev in [dest, source] {
            if self.require_size(state, dev)? < length {
                return Err(ControlError::rejected(format!(
                    "{dev} is smaller than the target"
                )));
            }
        }

        let nr_regions = div_up(length, region_size);
        let min_md = 64 + div_up(nr_regions, 4096);
        if md_size < min_md {
            return Err(ControlError::rejected(format!(
                "metadata device too small: {md_size} < {min_md} sectors"
            )));
        }

        let mut hydration = true;
        let mut discard_passdown = true;
        for feature in &features {
            match feature.as_str() {
                "no_hydration" => hydration = false,
                "no_discard_passdown" => discard_passdown = false,
                other => {
                    return Err(ControlError::rejected(format!("unknown feature {other}")));
                }
            }
        }

        let mut threshold = 1;
        let mut batch_size = 1;
        for (key, value) in &core_args {
            let value: u64 = value
                .parse()
                .map_err(|_| ControlError::rejected(format!("invalid value for {key}")))?;
            match key.as_str() {
                "hydration_threshold" => threshold = value,
                "hydration_batch_size" => batch_size = value,
                other => {
                    return Err(ControlError::rejected(format!("unknown core arg {other}")));
                }
            }
        }

        let key = self.resolve(state, md, 0);
        let meta = Metadata::Clone {
            region_size,
            size: length,
            hydrated: 0,
        };
        self.check_metadata(state, &key, &meta)?;

        Ok((
            TargetState::Clone(CloneState {
                md: key.clone(),
                md_total: md_size / MD_BLOCK_SECTORS,
                nr_regions,
                region_size,
                hydration,
                discard_passdown,
                threshold,
                batch_size,
            }),
            Some((key, meta)),
        ))
    }

    fn validate_cache(
        &self,
        state: &SimState,
        c: &mut StatusCursor<'_>,
        length: u64,
    ) -> Result<(TargetState, Option<(MetaKey, Metadata)>), ControlError> {
        let md = c.take_token("metadata device").map_err(rejected)?;
        let cache = c.take_token("cache device").map_err(rejected)?;
        let origin = c.take_token("origin device").map_err(rejected)?;
        let block_size = c.take_int("block size").map_err(rejected)?;
        let features = c.take_counted_list("features").map_err(rejected)?;
        let policy = c.take_token("policy").map_err(rejected)?.to_string();
        let policy_args = c.take_counted_pairs("policy args").map_err(rejected)?;

        if block_size % 64 != 0 || !(64..=2_097_152).contains(&block_size) {
            return Err(ControlError::rejected(format!(
                "invalid cache block size {block_size}"
            )));
        }
        for feature in &features {
            if !matches!(
                feature.as_str(),
                "writeback" | "writethrough" | "passthrough" | "metadata2" | "no_discard_passdown"
            ) {
                return Err(ControlError::rejected(format!("unknown feature {feature}")));
            }
        }
        if !matches!(policy.as_str(), "smq" | "mq" | "cleaner" | "default") {
            return Err(ControlError::rejected(format!("unknown policy {policy}")));
        }

        let md_size = self.require_size(state, md)?;
        let cache_size = self.require_size(state, cache)?;
        if self.require_size(state, origin)? < length {
            return Err(ControlError::rejected("origin device is smaller than the target"));
        }
        let cache_blocks = cache_size / block_size;
        if cache_blocks == 0 {
            return Err(ControlError::rejected("cache device smaller than one block"));
        }

        let key = self.resolve(state, md, 0);
        let meta = Metadata::Cache {
            block_size,
            dirty: 0,
        };
        self.check_metadata(state, &key, &meta)?;

        Ok((
            TargetState::Cache(CacheState {
                md: key.clone(),
                md_total: md_size / MD_BLOCK_SECTORS,
                block_size,
                cache_blocks,
                features,
                migration_threshold: 2048,
                policy,
                policy_args,
            }),
            Some((key, meta)),
        ))
    }

    fn validate_pool(
        &self,
        state: &SimState,
        c: &mut StatusCursor<'_>,
        length: u64,
    ) -> Result<(TargetState, Option<(MetaKey, Metadata)>), ControlError> {
        let md = c.take_token("metadata device").map_err(rejected)?;
        let data = c.take_token("data device").map_err(rejected)?;
        let block_size = c.take_int("block size").map_err(rejected)?;
        let low_water_mark = c.take_int("low water mark").map_err(rejected)?;
        let features = c.take_counted_list("features").map_err(rejected)?;

        if block_size % 128 != 0 || !(128..=2_097_152).contains(&block_size) {
            return Err(ControlError::rejected(format!(
                "invalid pool block size {block_size}"
            )));
        }

        let mut read_only = false;
        let mut discard_passdown = true;
        let mut error_if_no_space = false;
        for feature in &features {
            match feature.as_str() {
                "skip_block_zeroing" | "ignore_discard" => {}
                "no_discard_passdown" => discard_passdown = false,
                "read_only" => read_only = true,
                "error_if_no_space" => error_if_no_space = true,
                other => {
                    return Err(ControlError::rejected(format!("unknown feature {other}")));
                }
            }
        }

        let md_size = self.require_size(state, md)?;
        let data_size = self.require_size(state, data)?;
        if data_size < length {
            return Err(ControlError::rejected("data device is smaller than the target"));
        }

        let key = self.resolve(state, md, 0);
        let meta = Metadata::Pool {
            block_size,
            transaction_id: 0,
            thins: BTreeMap::new(),
            held_root: None,
        };
        self.check_metadata(state, &key, &meta)?;

        Ok((
            TargetState::Pool(PoolState {
                md: key.clone(),
                md_total: md_size / MD_BLOCK_SECTORS,
                data_blocks: length / block_size,
                low_water_mark,
                read_only,
                discard_passdown,
                error_if_no_space,
            }),
            Some((key, meta)),
        ))
    }

    fn bind(state: &mut SimState, bindings: Vec<(MetaKey, Metadata)>) {
        for (key, meta) in bindings {
            state.metadata.entry(key).or_insert(meta);
        }
    }

    fn target_status(state: &mut SimState, target: &SimTarget, suspended: bool) -> String {
        let step = state.hydration_step;
        match &target.state {
            TargetState::Clone(clone) => {
                let hydrated = match state.metadata.get_mut(&clone.md) {
                    Some(Metadata::Clone { hydrated, .. }) => hydrated,
                    _ => return "Fail".to_string(),
                };
                let mut hydrating = 0;
                if clone.hydration && !suspended && *hydrated < clone.nr_regions {
                    *hydrated += step.min(clone.nr_regions - *hydrated);
                    hydrating = step.min(clone.nr_regions - *hydrated);
                }

                let mut features = Vec::new();
                if !clone.hydration {
                    features.push("no_hydration");
                }
                if !clone.discard_passdown {
                    features.push("no_discard_passdown");
                }
                let md_used = 4 + div_up(clone.nr_regions, 32768);
                let mut out = format!(
                    "{} {}/{} {} {}/{} {} {}",
                    MD_BLOCK_SECTORS,
                    md_used,
                    clone.md_total,
                    clone.region_size,
                    *hydrated,
                    clone.nr_regions,
                    hydrating,
                    features.len()
                );
                for f in features {
                    out.push(' ');
                    out.push_str(f);
                }
                out.push_str(&format!(
                    " 4 hydration_threshold {} hydration_batch_size {} rw",
                    clone.threshold, clone.batch_size
                ));
                out
            }
            TargetState::Cache(cache) => {
                let dirty = match state.metadata.get_mut(&cache.md) {
                    Some(Metadata::Cache { dirty, .. }) => dirty,
                    _ => return "Fail".to_string(),
                };
                let reported = *dirty;
                if !suspended {
                    *dirty -= step.min(*dirty);
                }

                let mut out = format!(
                    "{} {}/{} {} {}/{} 0 0 0 0 0 0 {} {}",
                    MD_BLOCK_SECTORS,
                    4,
                    cache.md_total,
                    cache.block_size,
                    reported.min(cache.cache_blocks),
                    cache.cache_blocks,
                    reported,
                    cache.features.len()
                );
                for f in &cache.features {
                    out.push(' ');
                    out.push_str(f);
                }
                out.push_str(&format!(
                    " 2 migration_threshold {} {} {}",
                    cache.migration_threshold,
                    cache.policy,
                    cache.policy_args.len() * 2
                ));
                for (k, v) in &cache.policy_args {
                    out.push_str(&format!(" {k} {v}"));
                }
                out.push_str(" rw -");
                out
            }
            TargetState::Pool(pool) => {
                let Some(Metadata::Pool {
                    transaction_id,
                    held_root,
                    thins,
                    ..
                }) = state.metadata.get(&pool.md)
                else {
                    return "Fail".to_string();
                };
                format!(
                    "{} {}/{} 0/{} {} {} {} {} - {}",
                    transaction_id,
                    4 + thins.len() as u64,
                    pool.md_total,
                    pool.data_blocks,
                    held_root.map_or_else(|| "-".to_string(), |r| r.to_string()),
                    if pool.read_only { "ro" } else { "rw" },
                    if pool.discard_passdown {
                        "discard_passdown"
                    } else {
                        "no_discard_passdown"
                    },
                    if pool.error_if_no_space {
                        "error_if_no_space"
                    } else {
                        "queue_if_no_space"
                    },
                    pool.low_water_mark
                )
            }
            TargetState::Thin => "0 -".to_string(),
            TargetState::Linear | TargetState::Plain => String::new(),
        }
    }

    fn apply_message(
        state: &mut SimState,
        target: &mut SimTarget,
        message: &str,
    ) -> Result<String, ControlError> {
        let words: Vec<&str> = message.split_whitespace().collect();
        let number = |i: usize| -> Result<u64, ControlError> {
            words
                .get(i)
                .and_then(|w| w.parse().ok())
                .ok_or_else(|| ControlError::rejected(format!("invalid message '{message}'")))
        };

        match &mut target.state {
            TargetState::Clone(clone) => match words.as_slice() {
                ["enable_hydration"] => clone.hydration = true,
                ["disable_hydration"] => clone.hydration = false,
                ["hydration_threshold", _] => clone.threshold = number(1)?,
                ["hydration_batch_size", _] => clone.batch_size = number(1)?,
                _ => {
                    return Err(ControlError::rejected(format!(
                        "unsupported clone message '{message}'"
                    )));
                }
            },
            TargetState::Cache(cache) => match words.as_slice() {
                ["migration_threshold", _] => cache.migration_threshold = number(1)?,
                [key, value] if matches!(*key, "sequential_threshold" | "random_threshold" | "read_promote_adjustment" | "write_promote_adjustment") => {
                    let value = number(1).map(|_| value.to_string())?;
                    match cache.policy_args.iter_mut().find(|(k, _)| k == key) {
                        Some(slot) => slot.1 = value,
                        None => cache.policy_args.push((key.to_string(), value)),
                    }
                }
                _ => {
                    return Err(ControlError::rejected(format!(
                        "unsupported cache message '{message}'"
                    )));
                }
            },
            TargetState::Pool(pool) => {
                let Some(Metadata::Pool {
                    transaction_id,
                    thins,
                    held_root,
                    ..
                }) = state.metadata.get_mut(&pool.md)
                else {
                    return Err(ControlError::failed("pool metadata missing"));
                };
                match words.as_slice() {
                    ["create_thin", _] => {
                        let id = number(1)? as u32;
                        if thins.insert(id, None).is_some() {
                            return Err(ControlError::rejected(format!("device id {id} exists")));
                        }
                    }
                    ["create_snap", _, _] => {
                        let (id, origin) = (number(1)? as u32, number(2)? as u32);
                        if !thins.contains_key(&origin) {
                            return Err(ControlError::rejected(format!(
                                "unknown origin device {origin}"
                            )));
                        }
                        if thins.insert(id, Some(origin)).is_some() {
                            return Err(ControlError::rejected(format!("device id {id} exists")));
                        }
                    }
                    ["delete", _] => {
                        let id = number(1)? as u32;
                        if thins.remove(&id).is_none() {
                            return Err(ControlError::rejected(format!("unknown device {id}")));
                        }
                    }
                    ["set_transaction_id", _, _] => {
                        let (old, new) = (number(1)?, number(2)?);
                        if old != *transaction_id {
                            return Err(ControlError::rejected(format!(
                                "transaction id mismatch: pool has {transaction_id}, message has {old}"
                            )));
                        }
                        *transaction_id = new;
                    }
                    ["reserve_metadata_snap"] => {
                        if held_root.is_some() {
                            return Err(ControlError::rejected("metadata snapshot already held"));
                        }
                        *held_root = Some(4 + thins.len() as u64);
                    }
                    ["release_metadata_snap"] => {
                        if held_root.take().is_none() {
                            return Err(ControlError::rejected("no metadata snapshot held"));
                        }
                    }
                    _ => {
                        return Err(ControlError::rejected(format!(
                            "unsupported pool message '{message}'"
                        )));
                    }
                }
            }
            _ => {
                return Err(ControlError::rejected(format!(
                    "{} target does not accept messages",
                    target.target_type
                )));
            }
        }
        Ok(String::new())
    }
}

impl super::ControlPlane for SimControlPlane {
    fn create(&self, name: &str, table: &Table) -> Result<String, ControlError> {
        let mut state = self.state.lock();
        if state.devices.contains_key(name) {
            return Err(ControlError::rejected(format!("device {name} already exists")));
        }
        for target in table.targets() {
            if let Some(reason) = state.reject_create.remove(target.target_type()) {
                return Err(ControlError::rejected(reason));
            }
        }

        let (targets, bindings) = self.validate(&state, table)?;
        Self::bind(&mut state, bindings);
        state.devices.insert(
            name.to_string(),
            SimDevice {
                table: table.clone(),
                targets,
                pending: None,
                suspended: false,
            },
        );
        state.events.push(SimEvent::Create(name.to_string()));
        debug!(device = name, "sim create");
        Ok(format!("{DEV_DIR}/{name}"))
    }

    fn remove(&self, name: &str) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        if !state.devices.contains_key(name) {
            return Err(ControlError::not_found(format!("device {name} not found")));
        }

        let path = format!("{DEV_DIR}/{name}");
        let holders: HashSet<&String> = state
            .devices
            .iter()
            .filter(|(other, dev)| {
                *other != name
                    && dev
                        .table
                        .targets()
                        .iter()
                        .any(|t| t.args().iter().any(|a| *a == path))
            })
            .map(|(other, _)| other)
            .collect();
        if !holders.is_empty() {
            return Err(ControlError::failed(format!(
                "{name}: Device or resource busy (held by {holders:?})"
            )));
        }

        state.devices.remove(name);
        state.failed.remove(name);
        state.events.push(SimEvent::Remove(name.to_string()));
        debug!(device = name, "sim remove");
        Ok(())
    }

    fn suspend(&self, name: &str) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        let dev = state
            .devices
            .get_mut(name)
            .ok_or_else(|| ControlError::not_found(format!("device {name} not found")))?;
        dev.suspended = true;
        state.events.push(SimEvent::Suspend(name.to_string()));
        Ok(())
    }

    fn resume(&self, name: &str) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        let dev = state
            .devices
            .get_mut(name)
            .ok_or_else(|| ControlError::not_found(format!("device {name} not found")))?;
        let pending = dev.pending.take();
        let live = dev.table.clone();

        // the device comes out of suspend even if the new table is refused
        let staged = pending.is_some();
        let table = pending.map_or(live, |(table, _)| table);
        let checked = self.validate(&state, &table);
        if let Some(dev) = state.devices.get_mut(name) {
            dev.suspended = false;
        }
        state.events.push(SimEvent::Resume(name.to_string()));
        let (targets, bindings) = match checked {
            Ok(checked) => checked,
            Err(e) if staged => return Err(e),
            Err(_) => return Ok(()),
        };

        Self::bind(&mut state, bindings);
        if let Some(dev) = state.devices.get_mut(name) {
            if staged {
                dev.table = table;
                dev.targets = targets;
            } else {
                // metadata devices may have grown underneath the live table
                for (live, fresh) in dev.targets.iter_mut().zip(&targets) {
                    live.refresh_md_total(fresh);
                }
            }
        }
        Ok(())
    }

    fn load(&self, name: &str, table: &Table) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        if !state.devices.contains_key(name) {
            return Err(ControlError::not_found(format!("device {name} not found")));
        }
        if let Some(reason) = state.reject_load.take() {
            return Err(ControlError::rejected(reason));
        }

        let (targets, _) = self.validate(&state, table)?;
        if let Some(dev) = state.devices.get_mut(name) {
            dev.pending = Some((table.clone(), targets));
        }
        state.events.push(SimEvent::Load(name.to_string()));
        Ok(())
    }

    fn status(&self, name: &str) -> Result<String, ControlError> {
        let mut state = self.state.lock();
        let dev = state
            .devices
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::not_found(format!("device {name} not found")))?;
        let failed = state.failed.get(name).copied();

        let mut start = 0;
        let mut lines = Vec::new();
        for target in &dev.targets {
            let params = match failed {
                Some(kind) => kind.to_string(),
                None => Self::target_status(&mut state, target, dev.suspended),
            };
            let mut line = format!("{} {} {}", start, target.length, target.target_type);
            if !params.is_empty() {
                line.push(' ');
                line.push_str(&params);
            }
            lines.push(line);
            start += target.length;
        }
        Ok(lines.join("\n"))
    }

    fn message(&self, name: &str, sector: u64, message: &str) -> Result<String, ControlError> {
        let mut state = self.state.lock();
        let mut dev = state
            .devices
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::not_found(format!("device {name} not found")))?;
        if let Some(reason) = state.reject_message.take() {
            return Err(ControlError::rejected(reason));
        }

        let index = dev
            .targets
            .iter()
            .scan(0, |start, t| {
                let this = *start;
                *start += t.length;
                Some(this)
            })
            .zip(dev.targets.iter())
            .position(|(start, t)| sector >= start && sector < start + t.length)
            .ok_or_else(|| ControlError::rejected(format!("sector {sector} beyond device")))?;

        let reply = Self::apply_message(&mut state, &mut dev.targets[index], message)?;
        state.events.push(SimEvent::Message {
            device: name.to_string(),
            message: message.to_string(),
        });
        state.devices.insert(name.to_string(), dev);
        Ok(reply)
    }
}

impl ProcessRunner for SimControlPlane {
    fn run(&self, command: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        let mut state = self.state.lock();
        match command.program.as_str() {
            "dd" => {
                let (Some(path), Some(count)) = (command.keyed_arg("of"), command.keyed_arg("count"))
                else {
                    return Ok(ProcessOutput::failed(1, "dd: missing operand"));
                };
                let sectors: u64 = count.parse().unwrap_or(0);
                if self.size_of(&state, path).is_none() {
                    return Ok(ProcessOutput::failed(
                        1,
                        format!("dd: failed to open '{path}': No such file or directory"),
                    ));
                }

                let (root, offset) = self.resolve(&state, path, 0);
                state
                    .metadata
                    .retain(|(p, o), _| !(*p == root && *o >= offset && *o < offset + sectors));
                state.events.push(SimEvent::Wipe {
                    path: path.to_string(),
                    sectors,
                });
                Ok(ProcessOutput::ok(""))
            }
            "blockdev" => {
                let path = command.args.last().map(String::as_str).unwrap_or_default();
                match self.size_of(&state, path) {
                    Some(size) => Ok(ProcessOutput::ok(format!("{size}\n"))),
                    None => Ok(ProcessOutput::failed(
                        1,
                        format!("blockdev: cannot open {path}: No such file or directory"),
                    )),
                }
            }
            other => Ok(ProcessOutput::failed(127, format!("{other}: command not found"))),
        }
    }
}
