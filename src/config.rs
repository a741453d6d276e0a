//! Parameter loading.
//!
//! Values resolve in three layers: built-in defaults, then an optional TOML
//! config file (path in `SCR_CONF_FILE`), then `SCR_*` environment variables.
//! Later layers win, so an operator can override a site config per job from
//! the environment alone.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::descriptor::CopyType;
use crate::error::{Error, Result};

/// Default chunk size for messages carrying file data between partners.
pub const DEFAULT_MPI_BUF_SIZE: usize = 128 * 1024;
/// Default buffer size for file-to-file copies during flush and fetch.
pub const DEFAULT_FILE_BUF_SIZE: usize = 1024 * 1024;

/// One cache tier: a base directory and how many checkpoints it may hold
/// at once.
#[derive(Debug, Clone)]
pub struct CacheDesc {
    /// Storage tier root (RAM disk, SSD mount, ...).
    pub base: PathBuf,
    /// Maximum checkpoints cached concurrently at this base.
    pub size: usize,
}

/// Configuration for one checkpoint descriptor.
#[derive(Debug, Clone)]
pub struct CkptDescConfig {
    /// Whether this descriptor may be used.
    pub enabled: bool,
    /// Applies to checkpoint ids divisible by this interval.
    pub interval: u64,
    /// Storage tier the descriptor caches into.
    pub base: PathBuf,
    /// Redundancy scheme.
    pub copy_type: CopyType,
    /// Group size for XOR sets.
    pub set_size: usize,
    /// Node distance to partners.
    pub hop_distance: usize,
}

/// Resolved library parameters.
#[derive(Debug, Clone)]
pub struct Params {
    /// Master switch; init fails when disabled.
    pub enable: bool,
    /// Debug verbosity (0 quiet).
    pub debug: u32,
    /// Whether to emit telemetry events.
    pub log_enable: bool,
    /// User owning the cache directories.
    pub username: Option<String>,
    /// Job identity used in directory names.
    pub jobid: Option<String>,
    /// Human-readable job name for telemetry.
    pub jobname: Option<String>,
    /// This process's host name; equal names mean the same node.
    pub hostname: String,
    /// Base for node-local control files.
    pub cntl_base: PathBuf,
    /// Default base for the checkpoint cache.
    pub cache_base: PathBuf,
    /// Parallel file system prefix for flush/fetch.
    pub prefix: PathBuf,
    /// Default cache capacity when no cache descriptors are configured.
    pub cache_size: usize,
    /// Default redundancy scheme.
    pub copy_type: CopyType,
    /// Default XOR set size.
    pub set_size: usize,
    /// Default partner hop distance.
    pub hop_distance: usize,
    /// Halt when fewer than this many seconds remain in the allocation.
    pub halt_seconds: u64,
    /// Seconds remaining in the allocation, when the resource manager
    /// exposes it. `None` disables the time-remaining halt check.
    pub seconds_remaining: Option<u64>,
    /// Message chunk size for partner/XOR byte exchange.
    pub mpi_buf_size: usize,
    /// Buffer size for file copies.
    pub file_buf_size: usize,
    /// Whether init redistributes cached files after a restart.
    pub distribute: bool,
    /// Whether init may fetch from the parallel file system.
    pub fetch: bool,
    /// Flush every N checkpoints; 0 disables flushing.
    pub flush: u64,
    /// Concurrent writers during a flush.
    pub flush_width: usize,
    /// Concurrent readers during a fetch.
    pub fetch_width: usize,
    /// Force a flush of a rebuilt checkpoint on restart.
    pub flush_on_restart: bool,
    /// Job must restart from the parallel file system; clears the cache.
    pub global_restart: bool,
    /// Use the asynchronous flush path.
    pub flush_async: bool,
    /// Bandwidth budget recorded for the transfer daemon (bytes/sec).
    pub flush_async_bw: f64,
    /// Runtime percentage recorded for the transfer daemon.
    pub flush_async_percent: f64,
    /// Spawn the in-process transfer daemon when async flush is on. Turn
    /// off when an external mover drives the transfer file.
    pub flush_async_mover: bool,
    /// Poll interval for async-flush waits and the transfer daemon.
    pub poll_interval: Duration,
    /// Compute CRC32 during redundancy encode.
    pub crc_on_copy: bool,
    /// Compute/verify CRC32 during flush and fetch.
    pub crc_on_flush: bool,
    /// Verify CRC32 before deleting cached files.
    pub crc_on_delete: bool,
    /// Checkpoint every N calls to need-checkpoint; 0 disables.
    pub checkpoint_interval: u64,
    /// Minimum seconds between checkpoints; 0 disables.
    pub checkpoint_seconds: u64,
    /// Maximum percent overhead allowed for checkpointing; 0 disables.
    pub checkpoint_overhead: f64,
    /// Cache tiers; when empty a single tier at `cache_base` with
    /// `cache_size` slots is assumed.
    pub cache_descs: Vec<CacheDesc>,
    /// Checkpoint descriptors; when empty a single descriptor built from
    /// the scalar knobs is assumed.
    pub ckpt_descs: Vec<CkptDescConfig>,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            enable: true,
            debug: 0,
            log_enable: false,
            username: None,
            jobid: None,
            jobname: None,
            hostname: env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into()),
            cntl_base: PathBuf::from("/tmp"),
            cache_base: PathBuf::from("/tmp"),
            prefix: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            cache_size: 2,
            copy_type: CopyType::Xor,
            set_size: 8,
            hop_distance: 1,
            halt_seconds: 0,
            seconds_remaining: None,
            mpi_buf_size: DEFAULT_MPI_BUF_SIZE,
            file_buf_size: DEFAULT_FILE_BUF_SIZE,
            distribute: true,
            fetch: true,
            flush: 10,
            flush_width: 256,
            fetch_width: 256,
            flush_on_restart: false,
            global_restart: false,
            flush_async: false,
            flush_async_bw: 0.0,
            flush_async_percent: 0.0,
            flush_async_mover: true,
            poll_interval: Duration::from_secs(10),
            crc_on_copy: false,
            crc_on_flush: false,
            crc_on_delete: false,
            checkpoint_interval: 0,
            checkpoint_seconds: 0,
            checkpoint_overhead: 0.0,
            cache_descs: Vec::new(),
            ckpt_descs: Vec::new(),
        }
    }
}

impl Params {
    /// Defaults, then the system TOML file named by `SCR_CONF_FILE`, then a
    /// user `.scrconf` in the prefix directory, then `SCR_*` environment
    /// overrides (which always win).
    pub fn from_env() -> Result<Params> {
        let mut params = Params::default();
        if let Ok(path) = env::var("SCR_CONF_FILE") {
            params.apply_file(Path::new(&path))?;
        }
        params.apply_env_overrides()?;
        let user_conf = params.prefix.join(".scrconf");
        if user_conf.is_file() {
            params.apply_file(&user_conf)?;
            params.apply_env_overrides()?;
        }
        params.resolve_identity();
        Ok(params)
    }

    /// Load and apply a TOML config file over the current values.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        let file: ParamsFile = toml::from_str(&contents)?;
        file.apply(self)?;
        Ok(())
    }

    /// Apply `SCR_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_var("SCR_ENABLE") {
            self.enable = parse_flag("SCR_ENABLE", &v)?;
        }
        if let Some(v) = env_var("SCR_DEBUG") {
            self.debug = parse_num("SCR_DEBUG", &v)?;
        }
        if let Some(v) = env_var("SCR_LOG_ENABLE") {
            self.log_enable = parse_flag("SCR_LOG_ENABLE", &v)?;
        }
        if let Some(v) = env_var("SCR_USER_NAME") {
            self.username = Some(v);
        }
        if let Some(v) = env_var("SCR_JOB_ID") {
            self.jobid = Some(v);
        }
        if let Some(v) = env_var("SCR_JOB_NAME") {
            self.jobname = Some(v);
        }
        if let Some(v) = env_var("SCR_CNTL_BASE") {
            self.cntl_base = PathBuf::from(v);
        }
        if let Some(v) = env_var("SCR_CACHE_BASE") {
            self.cache_base = PathBuf::from(v);
        }
        if let Some(v) = env_var("SCR_PREFIX") {
            self.prefix = PathBuf::from(v);
        }
        if let Some(v) = env_var("SCR_CACHE_SIZE") {
            self.cache_size = parse_num("SCR_CACHE_SIZE", &v)?;
        }
        if let Some(v) = env_var("SCR_COPY_TYPE") {
            self.copy_type = CopyType::parse(&v).ok_or_else(|| Error::InvalidValue {
                key: "SCR_COPY_TYPE".into(),
                value: v,
            })?;
        }
        if let Some(v) = env_var("SCR_SET_SIZE") {
            self.set_size = parse_num("SCR_SET_SIZE", &v)?;
        }
        if let Some(v) = env_var("SCR_HOP_DISTANCE") {
            self.hop_distance = parse_num("SCR_HOP_DISTANCE", &v)?;
        }
        if let Some(v) = env_var("SCR_HALT_SECONDS") {
            self.halt_seconds = parse_num("SCR_HALT_SECONDS", &v)?;
        }
        if let Some(v) = env_var("SCR_MPI_BUF_SIZE") {
            self.mpi_buf_size = parse_bytes("SCR_MPI_BUF_SIZE", &v)? as usize;
        }
        if let Some(v) = env_var("SCR_FILE_BUF_SIZE") {
            self.file_buf_size = parse_bytes("SCR_FILE_BUF_SIZE", &v)? as usize;
        }
        if let Some(v) = env_var("SCR_DISTRIBUTE") {
            self.distribute = parse_flag("SCR_DISTRIBUTE", &v)?;
        }
        if let Some(v) = env_var("SCR_FETCH") {
            self.fetch = parse_flag("SCR_FETCH", &v)?;
        }
        if let Some(v) = env_var("SCR_FLUSH") {
            self.flush = parse_num("SCR_FLUSH", &v)?;
        }
        if let Some(v) = env_var("SCR_FLUSH_WIDTH") {
            self.flush_width = parse_num("SCR_FLUSH_WIDTH", &v)?;
        }
        if let Some(v) = env_var("SCR_FETCH_WIDTH") {
            self.fetch_width = parse_num("SCR_FETCH_WIDTH", &v)?;
        }
        if let Some(v) = env_var("SCR_FLUSH_ON_RESTART") {
            self.flush_on_restart = parse_flag("SCR_FLUSH_ON_RESTART", &v)?;
        }
        if let Some(v) = env_var("SCR_GLOBAL_RESTART") {
            self.global_restart = parse_flag("SCR_GLOBAL_RESTART", &v)?;
        }
        if let Some(v) = env_var("SCR_FLUSH_ASYNC") {
            self.flush_async = parse_flag("SCR_FLUSH_ASYNC", &v)?;
        }
        if let Some(v) = env_var("SCR_FLUSH_ASYNC_BW") {
            self.flush_async_bw = parse_float("SCR_FLUSH_ASYNC_BW", &v)?;
        }
        if let Some(v) = env_var("SCR_FLUSH_ASYNC_PERCENT") {
            self.flush_async_percent = parse_float("SCR_FLUSH_ASYNC_PERCENT", &v)?;
        }
        if let Some(v) = env_var("SCR_CRC_ON_COPY") {
            self.crc_on_copy = parse_flag("SCR_CRC_ON_COPY", &v)?;
        }
        if let Some(v) = env_var("SCR_CRC_ON_FLUSH") {
            self.crc_on_flush = parse_flag("SCR_CRC_ON_FLUSH", &v)?;
        }
        if let Some(v) = env_var("SCR_CRC_ON_DELETE") {
            self.crc_on_delete = parse_flag("SCR_CRC_ON_DELETE", &v)?;
        }
        if let Some(v) = env_var("SCR_CHECKPOINT_INTERVAL") {
            self.checkpoint_interval = parse_num("SCR_CHECKPOINT_INTERVAL", &v)?;
        }
        if let Some(v) = env_var("SCR_CHECKPOINT_SECONDS") {
            self.checkpoint_seconds = parse_num("SCR_CHECKPOINT_SECONDS", &v)?;
        }
        if let Some(v) = env_var("SCR_CHECKPOINT_OVERHEAD") {
            self.checkpoint_overhead = parse_float("SCR_CHECKPOINT_OVERHEAD", &v)?;
        }
        Ok(())
    }

    /// Fill username/jobid from the host environment when unset.
    pub fn resolve_identity(&mut self) {
        if self.username.is_none() {
            self.username = env::var("USER").ok();
        }
        if self.jobid.is_none() {
            self.jobid = env::var("SLURM_JOBID").ok();
        }
    }

    /// Cache tiers, falling back to one tier built from the scalar knobs.
    pub fn cache_descs(&self) -> Vec<CacheDesc> {
        if !self.cache_descs.is_empty() {
            return self.cache_descs.clone();
        }
        vec![CacheDesc {
            base: self.cache_base.clone(),
            size: self.cache_size,
        }]
    }

    /// Capacity of the cache tier rooted at `base`, 0 if unknown.
    pub fn cache_size_for(&self, base: &Path) -> usize {
        self.cache_descs()
            .iter()
            .find(|d| d.base == base)
            .map(|d| d.size)
            .unwrap_or(0)
    }

    /// Checkpoint descriptor configs, falling back to one descriptor built
    /// from the scalar knobs.
    pub fn ckpt_descs(&self) -> Vec<CkptDescConfig> {
        if !self.ckpt_descs.is_empty() {
            return self.ckpt_descs.clone();
        }
        vec![CkptDescConfig {
            enabled: true,
            interval: 1,
            base: self.cache_base.clone(),
            copy_type: self.copy_type,
            set_size: self.set_size,
            hop_distance: self.hop_distance,
        }]
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" => Ok(true),
        "0" | "false" | "FALSE" | "no" => Ok(false),
        _ => Err(Error::InvalidValue {
            key: key.into(),
            value: value.into(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::InvalidValue {
        key: key.into(),
        value: value.into(),
    })
}

fn parse_float(key: &str, value: &str) -> Result<f64> {
    parse_num(key, value)
}

/// Parse a byte count with an optional KB/MB/GB suffix.
fn parse_bytes(key: &str, value: &str) -> Result<u64> {
    let v = value.trim();
    let (digits, mult) = if let Some(d) = v.strip_suffix("GB") {
        (d, 1u64 << 30)
    } else if let Some(d) = v.strip_suffix("MB") {
        (d, 1 << 20)
    } else if let Some(d) = v.strip_suffix("KB") {
        (d, 1 << 10)
    } else {
        (v, 1)
    };
    let n: u64 = parse_num(key, digits.trim())?;
    Ok(n * mult)
}

/// TOML schema. Every field is optional; present fields override.
#[derive(Debug, Default, Deserialize)]
struct ParamsFile {
    enable: Option<bool>,
    debug: Option<u32>,
    log_enable: Option<bool>,
    user_name: Option<String>,
    job_id: Option<String>,
    job_name: Option<String>,
    cntl_base: Option<PathBuf>,
    cache_base: Option<PathBuf>,
    prefix: Option<PathBuf>,
    cache_size: Option<usize>,
    copy_type: Option<String>,
    set_size: Option<usize>,
    hop_distance: Option<usize>,
    halt_seconds: Option<u64>,
    mpi_buf_size: Option<String>,
    file_buf_size: Option<String>,
    distribute: Option<bool>,
    fetch: Option<bool>,
    flush: Option<u64>,
    flush_width: Option<usize>,
    fetch_width: Option<usize>,
    flush_on_restart: Option<bool>,
    global_restart: Option<bool>,
    flush_async: Option<bool>,
    flush_async_bw: Option<f64>,
    flush_async_percent: Option<f64>,
    crc_on_copy: Option<bool>,
    crc_on_flush: Option<bool>,
    crc_on_delete: Option<bool>,
    checkpoint_interval: Option<u64>,
    checkpoint_seconds: Option<u64>,
    checkpoint_overhead: Option<f64>,
    #[serde(default)]
    cachedesc: Vec<CacheDescSpec>,
    #[serde(default)]
    ckptdesc: Vec<CkptDescSpec>,
}

#[derive(Debug, Deserialize)]
struct CacheDescSpec {
    base: PathBuf,
    size: usize,
}

#[derive(Debug, Deserialize)]
struct CkptDescSpec {
    enabled: Option<bool>,
    interval: Option<u64>,
    base: Option<PathBuf>,
    #[serde(rename = "type")]
    copy_type: Option<String>,
    set_size: Option<usize>,
    hop_distance: Option<usize>,
}

impl ParamsFile {
    fn apply(self, params: &mut Params) -> Result<()> {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    params.$field = v;
                }
            };
        }
        take!(enable);
        take!(debug);
        take!(log_enable);
        take!(cache_size);
        take!(set_size);
        take!(hop_distance);
        take!(halt_seconds);
        take!(distribute);
        take!(fetch);
        take!(flush);
        take!(flush_width);
        take!(fetch_width);
        take!(flush_on_restart);
        take!(global_restart);
        take!(flush_async);
        take!(flush_async_bw);
        take!(flush_async_percent);
        take!(crc_on_copy);
        take!(crc_on_flush);
        take!(crc_on_delete);
        take!(checkpoint_interval);
        take!(checkpoint_seconds);
        take!(checkpoint_overhead);
        if let Some(v) = self.user_name {
            params.username = Some(v);
        }
        if let Some(v) = self.job_id {
            params.jobid = Some(v);
        }
        if let Some(v) = self.job_name {
            params.jobname = Some(v);
        }
        if let Some(v) = self.cntl_base {
            params.cntl_base = v;
        }
        if let Some(v) = self.cache_base {
            params.cache_base = v;
        }
        if let Some(v) = self.prefix {
            params.prefix = v;
        }
        if let Some(v) = self.copy_type {
            params.copy_type = CopyType::parse(&v).ok_or_else(|| Error::InvalidValue {
                key: "copy_type".into(),
                value: v,
            })?;
        }
        if let Some(v) = self.mpi_buf_size {
            params.mpi_buf_size = parse_bytes("mpi_buf_size", &v)? as usize;
        }
        if let Some(v) = self.file_buf_size {
            params.file_buf_size = parse_bytes("file_buf_size", &v)? as usize;
        }
        for spec in self.cachedesc {
            params.cache_descs.push(CacheDesc {
                base: spec.base,
                size: spec.size,
            });
        }
        for spec in self.ckptdesc {
            let base = spec.base.clone().unwrap_or_else(|| params.cache_base.clone());
            let copy_type = match spec.copy_type {
                Some(v) => CopyType::parse(&v).ok_or_else(|| Error::InvalidValue {
                    key: "ckptdesc.type".into(),
                    value: v,
                })?,
                None => params.copy_type,
            };
            params.ckpt_descs.push(CkptDescConfig {
                enabled: spec.enabled.unwrap_or(true),
                interval: spec.interval.unwrap_or(1),
                base,
                copy_type,
                set_size: spec.set_size.unwrap_or(params.set_size),
                hop_distance: spec.hop_distance.unwrap_or(params.hop_distance),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_interval_one_descriptor() {
        let params = Params::default();
        let descs = params.ckpt_descs();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].interval, 1);
        assert!(descs[0].enabled);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scr.toml");
        std::fs::write(
            &path,
            r#"
            cache_size = 3
            copy_type = "partner"
            mpi_buf_size = "64KB"

            [[ckptdesc]]
            interval = 1
            type = "LOCAL"

            [[ckptdesc]]
            interval = 4
            type = "XOR"
            set_size = 4
            "#,
        )
        .unwrap();

        let mut params = Params::default();
        params.apply_file(&path).unwrap();
        assert_eq!(params.cache_size, 3);
        assert_eq!(params.copy_type, CopyType::Partner);
        assert_eq!(params.mpi_buf_size, 64 * 1024);
        assert_eq!(params.ckpt_descs.len(), 2);
        assert_eq!(params.ckpt_descs[1].interval, 4);
        assert_eq!(params.ckpt_descs[1].copy_type, CopyType::Xor);
    }

    #[test]
    fn byte_suffixes() {
        assert_eq!(parse_bytes("k", "128KB").unwrap(), 128 * 1024);
        assert_eq!(parse_bytes("k", "2MB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_bytes("k", "4096").unwrap(), 4096);
        assert!(parse_bytes("k", "lots").is_err());
    }

    #[test]
    fn cache_size_lookup_by_base() {
        let mut params = Params::default();
        params.cache_descs.push(CacheDesc {
            base: PathBuf::from("/ssd"),
            size: 5,
        });
        assert_eq!(params.cache_size_for(Path::new("/ssd")), 5);
        assert_eq!(params.cache_size_for(Path::new("/ram")), 0);
    }
}
