//! `SEEK_DATA` / `SEEK_HOLE` over queried allocated ranges (spec §4.8, C8).

use crate::error::FabricError;

/// One allocated byte range, half-open `[offset, offset+length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Returns the next offset `>= from` that is inside an allocated range
/// (spec §4.8, `SEEK_DATA`). `ranges` must be sorted, non-overlapping, and
/// cover only `[0, file_size)`.
pub fn seek_data(ranges: &[Range], from: u64) -> Result<u64, FabricError> {
    for range in ranges {
        if from < range.offset {
            return Ok(range.offset);
        }
        if from < range.end() {
            return Ok(from);
        }
    }
    Err(FabricError::invalid("no such data"))
}

/// Returns the next offset `>= from` that is a hole, or `from` itself
/// when `from` already sits in a gap (spec §4.8, `SEEK_HOLE`). Everything
/// at or beyond the last range is a hole, up to EOF.
pub fn seek_hole(ranges: &[Range], from: u64) -> u64 {
    for range in ranges {
        if from < range.offset {
            return from;
        }
        if from < range.end() {
            return range.end();
        }
    }
    from
}

/// Queries the allocated-range map for one open file up to `size`, using
/// `lseek(2)` with `SEEK_DATA`/`SEEK_HOLE` to walk the file without
/// reading its contents. Falls back to treating the whole file as one
/// data range when the filesystem doesn't support the sparse-seek
/// primitives (spec §4.8, "If the platform does not support allocated-range
/// queries...").
#[cfg(target_os = "linux")]
pub fn query_ranges(fd: std::os::unix::io::RawFd, size: u64) -> Vec<Range> {
    use std::cmp::min;

    if size == 0 {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    let mut pos: i64 = 0;
    loop {
        let data_start = unsafe { libc::lseek(fd, pos, libc::SEEK_DATA) };
        if data_start < 0 {
            // ENXIO means "no more data past pos"; anything else means the
            // filesystem doesn't support the primitive at all.
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                break;
            }
            return vec![Range { offset: 0, length: size }];
        }
        let data_start = data_start as u64;
        if data_start >= size {
            break;
        }

        let hole_start = unsafe { libc::lseek(fd, data_start as i64, libc::SEEK_HOLE) };
        let data_end = if hole_start < 0 { size } else { min(hole_start as u64, size) };

        ranges.push(Range { offset: data_start, length: data_end - data_start });
        pos = data_end as i64;
        if pos as u64 >= size {
            break;
        }
    }

    if ranges.is_empty() {
        Vec::new()
    } else {
        ranges
    }
}

#[cfg(not(target_os = "linux"))]
pub fn query_ranges(_fd: i32, size: u64) -> Vec<Range> {
    vec![Range { offset: 0, length: size }]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ranges() -> Vec<Range> {
        // Mirrors spec §8 scenario 4: 5-byte writes at offsets 0, 1048576,
        // 3145728 on a 64 KiB-cluster volume, so each write occupies one
        // whole 65536-byte allocated range.
        const CLUSTER: u64 = 65536;
        vec![
            Range { offset: 0, length: CLUSTER },
            Range { offset: 1_048_576, length: CLUSTER },
            Range { offset: 3_145_728, length: CLUSTER },
        ]
    }

    #[test]
    fn seek_data_matches_spec_scenario() {
        let ranges = sample_ranges();
        assert_eq!(seek_data(&ranges, 0).unwrap(), 0);
        assert_eq!(seek_data(&ranges, 1_048_576).unwrap(), 1_048_576);
        assert_eq!(seek_data(&ranges, 2).unwrap(), 2);
        assert_eq!(seek_data(&ranges, 70_000).unwrap(), 1_048_576);
    }

    #[test]
    fn seek_hole_matches_spec_scenario() {
        let ranges = sample_ranges();
        assert_eq!(seek_hole(&ranges, 0), 65_536);
        assert_eq!(seek_hole(&ranges, 1_048_576), 1_114_112);
    }

    #[test]
    fn seek_data_past_last_range_fails() {
        let ranges = sample_ranges();
        assert!(seek_data(&ranges, 3_145_728 + 65_536 + 1).is_err());
    }

    #[test]
    fn seek_hole_past_last_range_returns_input_offset() {
        let ranges = sample_ranges();
        let past = 3_145_728 + 65_536 + 1;
        assert_eq!(seek_hole(&ranges, past), past);
    }

    #[test]
    fn empty_ranges_means_whole_file_is_a_hole() {
        assert_eq!(seek_hole(&[], 42), 42);
        assert!(seek_data(&[], 0).is_err());
    }
}
