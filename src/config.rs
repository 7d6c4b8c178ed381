use crate::error::CacheError;

/// Sizes and address layout of a [BlockCache](crate::BlockCache).
///
/// The default values describe a 32-bit guest with 32MB of main RAM, 64MB of extended RAM and a 32MB virtual memory
/// window, mapped into a 512MB physical address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of blocks in the table.
    pub max_blocks: usize,
    /// Guest bytes covered by the main RAM shadow cache. Must be a power of two.
    pub icache_size: u32,
    /// Guest bytes covered by the extended RAM shadow cache. Must be a power of two.
    pub icache_ex_size: u32,
    /// Guest bytes covered by the virtual memory shadow cache. Must be a power of two.
    pub icache_vmem_size: u32,
    /// Addresses with this bit set use the extended RAM shadow cache.
    pub exram_bit: u32,
    /// Addresses with this bit set use the virtual memory shadow cache. Checked before `exram_bit`.
    pub vmem_bit: u32,
    /// Mask turning a guest address into a physical address for range queries.
    pub physical_mask: u32,
    /// log2 of the granularity of the address validity index.
    pub valid_chunk_shift: u32,
    /// Capacity of the generated code arena in bytes.
    pub code_size: usize,
}

impl CacheConfig {
    pub const MAX_BLOCKS_VAR: &'static str = "JITCACHE_MAX_BLOCKS";
    pub const CODE_SIZE_VAR: &'static str = "JITCACHE_CODE_SIZE";

    /// Builds the default configuration, overridden by the `JITCACHE_MAX_BLOCKS` and `JITCACHE_CODE_SIZE`
    /// environment variables when set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(Self::MAX_BLOCKS_VAR) {
            match parse_size(&raw) {
                Some(n) => config.max_blocks = n,
                None => log::warn!("Unknown {} value {:?}; keeping {}", Self::MAX_BLOCKS_VAR, raw, config.max_blocks),
            }
        }

        if let Some(raw) = lookup(Self::CODE_SIZE_VAR) {
            match parse_size(&raw) {
                Some(n) => config.code_size = n,
                None => log::warn!("Unknown {} value {:?}; keeping {:#X}", Self::CODE_SIZE_VAR, raw, config.code_size),
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_blocks == 0 {
            return Err(CacheError::Config("max_blocks must be greater than 0".into()));
        }

        for (name, size) in [
            ("icache_size", self.icache_size),
            ("icache_ex_size", self.icache_ex_size),
            ("icache_vmem_size", self.icache_vmem_size),
        ] {
            if !size.is_power_of_two() || size < 4 {
                return Err(CacheError::Config(format!("{name} ({size:#X}) must be a power of two of at least 4")));
            }
        }

        if self.valid_chunk_shift < 2 || self.valid_chunk_shift > 16 {
            return Err(CacheError::Config(format!("valid_chunk_shift ({}) must be in 2..=16", self.valid_chunk_shift)));
        }

        if self.code_size < Self::MIN_CODE_SIZE {
            return Err(CacheError::Config(format!("code_size ({:#X}) is smaller than {:#X}", self.code_size, Self::MIN_CODE_SIZE)));
        }

        Ok(())
    }

    const MIN_CODE_SIZE: usize = 0x100;
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_blocks: 65536 * 2,
            icache_size: 0x200_0000,
            icache_ex_size: 0x400_0000,
            icache_vmem_size: 0x200_0000,
            exram_bit: 0x1000_0000,
            vmem_bit: 0x2000_0000,
            physical_mask: 0x1FFF_FFFF,
            valid_chunk_shift: 5,
            code_size: 32 * 1024 * 1024,
        }
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal size.
fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().replace('_', "");
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(CacheConfig::default().validate(), Ok(()));
    }

    #[test]
    fn sizes_parse_in_decimal_and_hex() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size(" 0x1000 "), Some(4096));
        assert_eq!(parse_size("0x100_0000"), Some(0x100_0000));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let config = CacheConfig::from_lookup(|key| match key {
            CacheConfig::MAX_BLOCKS_VAR => Some("512".to_string()),
            CacheConfig::CODE_SIZE_VAR => Some("big".to_string()),
            _ => None,
        });
        assert_eq!(config.max_blocks, 512);
        assert_eq!(config.code_size, CacheConfig::default().code_size);
    }

    #[test]
    fn validate_rejects_bad_layouts() {
        let config = CacheConfig { max_blocks: 0, ..CacheConfig::default() };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let config = CacheConfig { icache_ex_size: 0x300_0000, ..CacheConfig::default() };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let config = CacheConfig { code_size: 16, ..CacheConfig::default() };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }
}
