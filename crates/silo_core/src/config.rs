//! Silo configuration and eviction thresholds.

use crate::error::{SiloError, SiloResult};
use crate::object::DESC_SIZE;
use crate::region::{round_down, round_up};
use crate::sign::SIGN_SPACE;
use std::time::Duration;

/// Configuration for creating or mounting a silo.
#[derive(Debug, Clone)]
pub struct SiloConfig {
    /// Name used in log output.
    pub name: String,

    /// Smallest allocation unit in bytes. Must match the ident at mount.
    pub granularity: u32,

    /// Record alignment inside the silo.
    pub align: u32,

    /// Size of each of the four table regions (None = derived).
    pub table_size: Option<u64>,

    /// Fewest segments the aging thread leaves behind without space pressure.
    pub min_nseg: u32,

    /// Most segments the silo may hold (None = table capacity).
    pub max_nseg: Option<u32>,

    /// Preferred segment length (None = space / aim_nseg).
    pub aim_segl: Option<u64>,

    /// Longest segment (None = space / min_nseg).
    pub max_segl: Option<u64>,

    /// Free bytes the aging thread keeps in reserve (None = derived).
    pub free_reserve: Option<u64>,

    /// How long the aging thread sleeps between passes.
    pub aging_interval: Duration,

    /// Whether mounting starts the background aging thread.
    pub background_aging: bool,

    /// Whether every insert commits the segment signature before returning.
    pub sync_on_insert: bool,
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            name: "silo".to_string(),
            granularity: 512,
            align: 8,
            table_size: None,
            min_nseg: 10,
            max_nseg: None,
            aim_segl: None,
            max_segl: None,
            free_reserve: None,
            // pi - 2 seconds, so the wakeups drift against round timers
            aging_interval: Duration::from_micros(1_141_593),
            background_aging: true,
            sync_on_insert: false,
        }
    }
}

impl SiloConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the name used in log output.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the granularity.
    #[must_use]
    pub const fn granularity(mut self, granularity: u32) -> Self {
        self.granularity = granularity;
        self
    }

    /// Sets the record alignment.
    #[must_use]
    pub const fn align(mut self, align: u32) -> Self {
        self.align = align;
        self
    }

    /// Sets the size of each table region.
    #[must_use]
    pub const fn table_size(mut self, size: u64) -> Self {
        self.table_size = Some(size);
        self
    }

    /// Sets the minimum segment count.
    #[must_use]
    pub const fn min_nseg(mut self, n: u32) -> Self {
        self.min_nseg = n;
        self
    }

    /// Sets the maximum segment count.
    #[must_use]
    pub const fn max_nseg(mut self, n: u32) -> Self {
        self.max_nseg = Some(n);
        self
    }

    /// Sets the preferred segment length.
    #[must_use]
    pub const fn aim_segl(mut self, len: u64) -> Self {
        self.aim_segl = Some(len);
        self
    }

    /// Sets the maximum segment length.
    #[must_use]
    pub const fn max_segl(mut self, len: u64) -> Self {
        self.max_segl = Some(len);
        self
    }

    /// Sets the free space reserve.
    #[must_use]
    pub const fn free_reserve(mut self, bytes: u64) -> Self {
        self.free_reserve = Some(bytes);
        self
    }

    /// Sets the aging interval.
    #[must_use]
    pub const fn aging_interval(mut self, interval: Duration) -> Self {
        self.aging_interval = interval;
        self
    }

    /// Sets whether the background aging thread runs.
    #[must_use]
    pub const fn background_aging(mut self, value: bool) -> Self {
        self.background_aging = value;
        self
    }

    /// Sets whether inserts are synced before returning.
    #[must_use]
    pub const fn sync_on_insert(mut self, value: bool) -> Self {
        self.sync_on_insert = value;
        self
    }
}

/// Eviction and sizing thresholds in effect for a mounted silo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Fewest segments left after an aging pass without space pressure.
    pub min_nseg: u32,
    /// Segment count aging converges to.
    pub aim_nseg: u32,
    /// Most segments the silo holds.
    pub max_nseg: u32,
    /// Shortest segment placed at the tail of the space.
    pub min_segl: u64,
    /// Length of a new segment.
    pub aim_segl: u64,
    /// Longest segment.
    pub max_segl: u64,
    /// Free bytes kept in reserve.
    pub free_reserve: u64,
}

/// Smallest segment that can hold one object of `granularity` bytes.
#[must_use]
pub const fn min_segment_len(granularity: u64) -> u64 {
    round_up(SIGN_SPACE + DESC_SIZE, granularity) + granularity
}

impl Thresholds {
    /// Derives thresholds from the silo geometry and the configured overrides.
    ///
    /// `space` is the length of the segment space and `table_entries` the
    /// number of segments the segment table can describe.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the space cannot hold `min_nseg`
    /// minimal segments or an override is out of range.
    pub fn derive(
        space: u64,
        table_entries: u32,
        granularity: u32,
        config: &SiloConfig,
    ) -> SiloResult<Self> {
        let gran = u64::from(granularity);
        let floor = min_segment_len(gran);

        let max_nseg = config
            .max_nseg
            .map_or(table_entries, |n| n.min(table_entries))
            .min(u32::try_from(space / floor).unwrap_or(u32::MAX));
        let min_nseg = config.min_nseg.max(1);
        if max_nseg < min_nseg {
            return Err(SiloError::config(format!(
                "segment space of {space} bytes holds at most {max_nseg} segments, {min_nseg} required"
            )));
        }

        // floor(sqrt(min * max)), kept inside [min, max]
        let product = u64::from(min_nseg) * u64::from(max_nseg);
        let mut aim_nseg = (product as f64).sqrt() as u64;
        while aim_nseg * aim_nseg > product {
            aim_nseg -= 1;
        }
        let aim_nseg = u32::try_from(aim_nseg)
            .unwrap_or(max_nseg)
            .clamp(min_nseg, max_nseg);

        let max_segl = config
            .max_segl
            .unwrap_or(space / u64::from(min_nseg));
        let max_segl = round_down(max_segl.min(space), gran);
        if max_segl < floor {
            return Err(SiloError::config(format!(
                "max segment length {max_segl} below the {floor} byte minimum"
            )));
        }
        let min_segl = round_down(space / u64::from(max_nseg), gran).clamp(floor, max_segl);
        let aim_segl = config
            .aim_segl
            .unwrap_or(space / u64::from(aim_nseg));
        let aim_segl = round_down(aim_segl, gran).clamp(min_segl, max_segl);

        let free_reserve = config
            .free_reserve
            .unwrap_or(aim_segl.saturating_mul(10))
            .min(space / 4);
        let free_reserve = round_down(free_reserve, gran);

        Ok(Self {
            min_nseg,
            aim_nseg,
            max_nseg,
            min_segl,
            aim_segl,
            max_segl,
            free_reserve,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn default_config() {
        let config = SiloConfig::default();
        assert_eq!(config.granularity, 512);
        assert_eq!(config.min_nseg, 10);
        assert!(config.background_aging);
        assert!(!config.sync_on_insert);
        assert!(config.aging_interval > Duration::from_secs(1));
    }

    #[test]
    fn builder_pattern() {
        let config = SiloConfig::new()
            .name("s0")
            .granularity(4096)
            .max_nseg(6)
            .background_aging(false);

        assert_eq!(config.name, "s0");
        assert_eq!(config.granularity, 4096);
        assert_eq!(config.max_nseg, Some(6));
        assert!(!config.background_aging);
    }

    #[test]
    fn derived_thresholds_are_consistent() {
        let t = Thresholds::derive(6 * MIB, 9000, 512, &SiloConfig::default()).unwrap();
        assert_eq!(t.min_nseg, 10);
        assert!(t.min_nseg <= t.aim_nseg && t.aim_nseg <= t.max_nseg);
        assert!(t.min_segl <= t.aim_segl && t.aim_segl <= t.max_segl);
        assert_eq!(t.max_segl % 512, 0);
        assert_eq!(t.aim_segl % 512, 0);
        assert!(t.free_reserve <= 6 * MIB / 4);
    }

    #[test]
    fn aim_is_geometric_mean() {
        let config = SiloConfig::new().min_nseg(2).max_nseg(8);
        let t = Thresholds::derive(4 * MIB, 1000, 512, &config).unwrap();
        assert_eq!(t.max_nseg, 8);
        assert_eq!(t.aim_nseg, 4);
    }

    #[test]
    fn overrides_are_clamped() {
        let config = SiloConfig::new().max_segl(4096).aim_segl(64 * 1024);
        let t = Thresholds::derive(4 * MIB, 1000, 512, &config).unwrap();
        assert_eq!(t.max_segl, 4096);
        assert_eq!(t.aim_segl, 4096);
        assert!(t.min_segl <= 4096);
    }

    #[test]
    fn max_nseg_limited_by_table() {
        let config = SiloConfig::new().max_nseg(100_000);
        let t = Thresholds::derive(64 * MIB, 500, 512, &config).unwrap();
        assert_eq!(t.max_nseg, 500);
    }

    #[test]
    fn too_small_space_rejected() {
        let err = Thresholds::derive(8 * 1024, 1000, 512, &SiloConfig::default()).unwrap_err();
        assert!(err.is_config());
    }
}
