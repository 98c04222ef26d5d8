//! The TOML configuration: run defaults and the bdevs to create.
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use iocmd_bdev::{BdevRegistry, CompletionOrder, Lba, MallocBdev, MallocParams, ZonedParams};
use itertools::Itertools;
use serde::{de, Deserialize};
use serde_inline_default::serde_inline_default;

pub const DEFAULT_BDEV: &str = "Malloc0";

const XDG_CONFIG_DIR_NAME: &str = "iocmd";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(rename = "bdev", default)]
    pub bdevs: Vec<BdevConfig>,
}

#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde_inline_default(DEFAULT_BDEV.to_owned())]
    pub bdev: String,
    #[serde(default, deserialize_with = "de_duration")]
    pub stage_timeout: Option<Duration>,
    #[serde_inline_default(NonZeroU32::MIN)]
    pub runs: NonZeroU32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            bdev: DEFAULT_BDEV.to_owned(),
            stage_timeout: None,
            runs: NonZeroU32::MIN,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BdevConfig {
    pub name: String,
    #[serde(deserialize_with = "de_size")]
    pub block_size: u32,
    pub num_blocks: u64,
    #[serde_inline_default(1)]
    pub write_unit_size: u32,
    /// Defaults to the block size.
    #[serde(default, deserialize_with = "de_opt_size")]
    pub buf_align: Option<usize>,
    #[serde_inline_default(64)]
    pub queue_depth: usize,
    #[serde(default)]
    pub completion_order: CompletionOrder,
    #[serde(default)]
    pub zoned: Option<ZonedConfig>,
}

/// Zone sizes are in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZonedConfig {
    pub zone_size: u64,
    /// Defaults to the zone size.
    #[serde(default)]
    pub zone_capacity: Option<u64>,
    #[serde(default)]
    pub max_open_zones: u32,
    #[serde(default)]
    pub max_active_zones: u32,
    #[serde(default)]
    pub max_zone_append_size: u64,
}

fn de_size<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: de::Deserializer<'de>,
    T: TryFrom<u64>,
{
    use serde::de::Error;

    let n = bytesize::ByteSize::deserialize(de)?;
    n.0.try_into()
        .map_err(|_| D::Error::custom(format_args!("overflow: {}", n.0)))
}

fn de_opt_size<'de, D: de::Deserializer<'de>>(de: D) -> Result<Option<usize>, D::Error> {
    de_size(de).map(Some)
}

fn de_duration<'de, D: de::Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
    let s = String::deserialize(de)?;
    humantime::parse_duration(&s)
        .map(Some)
        .map_err(de::Error::custom)
}

impl Default for Config {
    /// A single zoned `Malloc0` of 20 zones, each of 4096 blocks of 4KiB.
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            bdevs: vec![BdevConfig {
                name: DEFAULT_BDEV.to_owned(),
                block_size: 4 << 10,
                num_blocks: 20 * 4096,
                write_unit_size: 1,
                buf_align: None,
                queue_depth: 64,
                completion_order: CompletionOrder::Fifo,
                zoned: Some(ZonedConfig {
                    zone_size: 4096,
                    zone_capacity: None,
                    max_open_zones: 0,
                    max_active_zones: 0,
                    max_zone_append_size: 256,
                }),
            }],
        }
    }
}

/// `$XDG_CONFIG_HOME/iocmd/config.toml`, if the config directory is known.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join(XDG_CONFIG_DIR_NAME).join("config.toml"))
}

impl Config {
    /// Load from `path`, or the default path if it exists, or fall back to the built-in default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_owned(),
            None => match default_path().filter(|path| path.exists()) {
                Some(path) => path,
                None => {
                    tracing::debug!("no config file, using built-in default");
                    return Ok(Self::default());
                }
            },
        };
        tracing::debug!(path = %path.display(), "loading config");
        let buf = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&buf).context("failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.bdevs.is_empty(), "no bdev is defined");
        if let Some(dup) = self.bdevs.iter().map(|b| &b.name).duplicates().next() {
            anyhow::bail!("duplicated bdev name {dup:?}");
        }
        for bdev in &self.bdevs {
            bdev.validate()
                .with_context(|| format!("invalid bdev {:?}", bdev.name))?;
        }
        ensure!(
            self.bdev(&self.run.bdev).is_some(),
            "bdev {:?} is not defined, available: {}",
            self.run.bdev,
            self.bdevs.iter().map(|b| &b.name).join(", "),
        );
        Ok(())
    }

    #[must_use]
    pub fn bdev(&self, name: &str) -> Option<&BdevConfig> {
        self.bdevs.iter().find(|b| b.name == name)
    }

    /// Create every configured bdev.
    pub fn build_registry(&self) -> Result<BdevRegistry> {
        let mut registry = BdevRegistry::new();
        for bdev in &self.bdevs {
            let malloc = MallocBdev::new(&bdev.name, bdev.params())
                .with_context(|| format!("failed to create bdev {:?}", bdev.name))?;
            registry
                .register(malloc)
                .with_context(|| format!("failed to register bdev {:?}", bdev.name))?;
        }
        Ok(registry)
    }
}

impl BdevConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.block_size.is_power_of_two() && self.block_size >= 512,
            "`block_size` must be a power of two and at least 512B",
        );
        ensure!(self.num_blocks != 0, "`num_blocks` must not be zero");
        ensure!(
            self.write_unit_size != 0,
            "`write_unit_size` must not be zero"
        );
        ensure!(self.queue_depth != 0, "`queue_depth` must not be zero");
        if let Some(align) = self.buf_align {
            ensure!(align.is_power_of_two(), "`buf_align` must be a power of two");
        }
        if let Some(zoned) = &self.zoned {
            ensure!(
                zoned.zone_size != 0 && self.num_blocks % zoned.zone_size == 0,
                "`num_blocks` must be a multiple of a non-zero `zone_size`",
            );
            let capacity = zoned.zone_capacity.unwrap_or(zoned.zone_size);
            ensure!(
                1 <= capacity && capacity <= zoned.zone_size,
                "`zone_capacity` must be in range [1, zone_size]",
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn params(&self) -> MallocParams {
        MallocParams {
            write_unit_size: self.write_unit_size,
            buf_align: self.buf_align.unwrap_or(self.block_size as usize),
            queue_depth: self.queue_depth,
            completion_order: self.completion_order,
            zoned: self.zoned.map(|zoned| ZonedParams {
                zone_size: Lba(zoned.zone_size),
                zone_capacity: Lba(zoned.zone_capacity.unwrap_or(zoned.zone_size)),
                max_open_zones: zoned.max_open_zones,
                max_active_zones: zoned.max_active_zones,
                max_zone_append_size: Lba(zoned.max_zone_append_size),
            }),
            ..MallocParams::new(self.block_size, self.num_blocks)
        }
    }
}
