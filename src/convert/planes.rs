/// Copy `rows` rows of `row_bytes` visible bytes between two strided planes.
///
/// # Performance
/// - Fast path 1: identical strides -> single memcpy
/// - Fast path 2: both sides tightly packed -> single memcpy
/// - Fallback: row-by-row copy
///
/// Returns false when either side is too short for the requested geometry.
#[inline]
pub fn copy_plane(
    source: &[u8],
    source_stride: usize,
    destination: &mut [u8],
    destination_stride: usize,
    row_bytes: usize,
    rows: usize,
) -> bool {
    if rows == 0 || row_bytes == 0 {
        return true;
    }
    if source_stride < row_bytes || destination_stride < row_bytes {
        return false;
    }

    // last row only needs its visible bytes
    let source_needed = (rows - 1) * source_stride + row_bytes;
    let destination_needed = (rows - 1) * destination_stride + row_bytes;
    if source.len() < source_needed || destination.len() < destination_needed {
        return false;
    }

    if source_stride == destination_stride {
        destination[..source_needed].copy_from_slice(&source[..source_needed]);
        return true;
    }

    if source_stride == row_bytes && destination_stride == row_bytes {
        let len = row_bytes * rows;
        destination[..len].copy_from_slice(&source[..len]);
        return true;
    }

    for r in 0..rows {
        let src_start = r * source_stride;
        let dst_start = r * destination_stride;
        destination[dst_start..dst_start + row_bytes]
            .copy_from_slice(&source[src_start..src_start + row_bytes]);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_with_matching_strides() {
        let source: Vec<u8> = (0..32).collect();
        let mut destination = vec![0u8; 32];
        assert!(copy_plane(&source, 8, &mut destination, 8, 6, 4));
        assert_eq!(&destination[..6], &source[..6]);
        assert_eq!(&destination[24..30], &source[24..30]);
    }

    #[test]
    fn test_copy_between_strides() {
        let source: Vec<u8> = (0..12).collect();
        let mut destination = vec![0xFFu8; 3 * 8];
        assert!(copy_plane(&source, 4, &mut destination, 8, 4, 3));
        assert_eq!(&destination[0..4], &[0, 1, 2, 3]);
        assert_eq!(&destination[8..12], &[4, 5, 6, 7]);
        assert_eq!(&destination[16..20], &[8, 9, 10, 11]);
        // padding untouched
        assert_eq!(destination[4], 0xFF);
    }

    #[test]
    fn test_copy_rejects_short_buffers() {
        let source = vec![0u8; 10];
        let mut destination = vec![0u8; 64];
        assert!(!copy_plane(&source, 4, &mut destination, 8, 4, 3));
        assert!(!copy_plane(&source, 2, &mut destination, 8, 4, 1));
        assert!(copy_plane(&source, 4, &mut destination, 8, 4, 0));
    }
}
