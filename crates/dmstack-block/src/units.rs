//! Sector units
//!
//! Device-mapper lengths and offsets are counted in 512-byte sectors.

/// Bytes per sector
pub const SECTOR_SIZE: u64 = 512;

/// Kibibytes to sectors
pub const fn k(n: u64) -> u64 {
    n * 2
}

/// Mebibytes to sectors
pub const fn meg(n: u64) -> u64 {
    n * 2048
}

/// Gibibytes to sectors
pub const fn gig(n: u64) -> u64 {
    n * 2048 * 1024
}

/// Integer division rounding up
pub const fn div_up(n: u64, d: u64) -> u64 {
    n.div_ceil(d)
}

/// Human readable size of a sector count
pub fn format_sectors(sectors: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    let bytes = sectors * SECTOR_SIZE;
    if bytes >= TB {
        format!("{:.2} TiB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(k(4), 8);
        assert_eq!(meg(4), 8192);
        assert_eq!(gig(1), 2_097_152);
        assert_eq!(div_up(gig(1), k(4)), 262_144);
        assert_eq!(div_up(9, 8), 2);
    }

    #[test]
    fn test_format_sectors() {
        assert_eq!(format_sectors(1), "512 B");
        assert_eq!(format_sectors(k(4)), "4.00 KiB");
        assert_eq!(format_sectors(gig(1)), "1.00 GiB");
    }
}
