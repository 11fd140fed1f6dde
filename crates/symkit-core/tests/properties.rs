//! Tests for the invariants of the low-level building blocks: LEB128
//! decoding, cursor bounds, line-table ordering and range-map lookup

use gimli::leb128;
use symkit_core::cursor::BinaryCursor;
use symkit_core::line_table::{FileId, LineTable};
use symkit_core::range_map::{RangeEntry, RangeMap};

/// xorshift64*, enough to sweep inputs reproducibly
struct Rng(u64);

impl Rng
{
    fn next(&mut self) -> u64
    {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn below(&mut self, bound: u64) -> u64
    {
        self.next() % bound
    }
}

fn unsigned_samples() -> Vec<u64>
{
    let mut values = vec![0, 1, 0x7f, 0x80, 0x3fff, 0x4000, u64::from(u32::MAX), u64::MAX - 1, u64::MAX];
    values.extend((0..64).map(|bit| 1u64 << bit));
    values.extend((1..64).map(|bit| (1u64 << bit) - 1));
    let mut rng = Rng(0x9e37_79b9_7f4a_7c15);
    values.extend((0..2000).map(|_| rng.next() >> rng.below(64)));
    values
}

#[test]
fn test_uleb128_matches_reference_encoder()
{
    for value in unsigned_samples() {
        let mut encoded = Vec::new();
        leb128::write::unsigned(&mut encoded, value).unwrap();
        let mut cursor = BinaryCursor::new(&encoded);
        assert_eq!(cursor.read_uleb128().unwrap(), value, "value {value:#x}");
        assert!(cursor.is_empty());
    }
}

#[test]
fn test_sleb128_matches_reference_encoder()
{
    let mut values: Vec<i64> = unsigned_samples().into_iter().map(|v| v as i64).collect();
    values.extend([i64::MIN, i64::MIN + 1, -1, -64, -65, 63, 64, i64::MAX]);
    for value in values {
        let mut encoded = Vec::new();
        leb128::write::signed(&mut encoded, value).unwrap();
        let mut cursor = BinaryCursor::new(&encoded);
        assert_eq!(cursor.read_sleb128().unwrap(), value, "value {value}");
        assert!(cursor.is_empty());
    }
}

#[test]
fn test_truncated_leb128_stays_in_bounds()
{
    for value in unsigned_samples().into_iter().filter(|&v| v >= 0x80) {
        let mut encoded = Vec::new();
        leb128::write::unsigned(&mut encoded, value).unwrap();
        let truncated = &encoded[..encoded.len() - 1];

        let mut cursor = BinaryCursor::new(truncated);
        assert!(cursor.read_uleb128().is_err());
        assert_eq!(cursor.offset(), 0);

        // Same bytes, but the bound cuts the last one off.
        let mut cursor = BinaryCursor::with_range(&encoded, 0, encoded.len() - 1);
        assert!(cursor.read_sleb128().is_err());
        assert_eq!(cursor.offset(), 0);
        assert!(cursor.offset() <= cursor.limit());
    }
}

#[test]
fn test_uleb128_overflow_is_rejected()
{
    let eleven = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
    assert!(BinaryCursor::new(&eleven).read_uleb128().is_err());
    let too_wide = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02];
    assert!(BinaryCursor::new(&too_wide).read_uleb128().is_err());
    // Zero padding past 64 bits is still the same number.
    let padded = [0x81, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00];
    assert_eq!(BinaryCursor::new(&padded).read_uleb128().unwrap(), 1);
}

#[test]
fn test_cursor_never_passes_its_limit()
{
    let data: Vec<u8> = (0..=255u8).cycle().take(96).collect();
    let mut rng = Rng(0x0123_4567_89ab_cdef);
    for _ in 0..200 {
        let start = rng.below(48) as usize;
        let end = start + rng.below(48) as usize;
        let mut cursor = BinaryCursor::with_range(&data, start, end);
        for _ in 0..64 {
            let before = cursor.offset();
            let ok = match rng.below(8) {
                0 => cursor.seek(rng.below(100) as usize).is_ok(),
                1 => cursor.skip(rng.below(12) as usize).is_ok(),
                2 => cursor.read_u8().is_ok(),
                3 => cursor.read_u16().is_ok(),
                4 => cursor.read_u32().is_ok(),
                5 => cursor.read_u64().is_ok(),
                6 => cursor.read_bytes(rng.below(20) as usize).is_ok(),
                _ => cursor.skip_signed(rng.below(40) as i64 - 20).is_ok(),
            };
            assert!(cursor.offset() <= cursor.limit());
            if !ok {
                assert_eq!(cursor.offset(), before, "failed operation moved the cursor");
                assert!(cursor.has_error());
            }
        }
    }
}

#[test]
fn test_sub_cursor_is_bounded_by_parent()
{
    let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
    let mut parent = BinaryCursor::new(&data);
    parent.skip(2).unwrap();
    let mut child = parent.sub_cursor(4).unwrap();
    assert_eq!(parent.offset(), 6);
    assert_eq!(child.read_u32().unwrap(), u32::from_le_bytes([3, 4, 5, 6]));
    assert!(child.read_u8().is_err());
    assert!(parent.sub_cursor(3).is_err());
    assert_eq!(parent.offset(), 6);
}

#[test]
fn test_line_table_is_sorted_and_spans_gaps()
{
    let mut rng = Rng(0xfeed_f00d);
    let mut builder = LineTable::builder();
    let file = builder.add_file("main.c");
    let mut addresses: Vec<u64> = (0..64).map(|_| 0x1000 + rng.below(0x800)).collect();
    addresses.sort_unstable();
    addresses.dedup();
    let mut shuffled = addresses.clone();
    for i in (1..shuffled.len()).rev() {
        shuffled.swap(i, rng.below(i as u64 + 1) as usize);
    }
    for &address in &shuffled {
        builder.push_row(address, (address - 0x1000) as u32 + 1, 0, file);
    }
    let table = builder.finish();

    let rows: Vec<_> = table.iter().collect();
    assert_eq!(rows.len(), addresses.len());
    assert!(rows.windows(2).all(|pair| pair[0].address <= pair[1].address));

    for (i, window) in addresses.windows(2).enumerate() {
        let (lo, hi) = (window[0], window[1]);
        let mid = lo + (hi - lo) / 2;
        let hit = table.lookup(mid).unwrap();
        assert_eq!(hit.address, lo, "row {i}");
        assert_eq!(hit.line, (lo - 0x1000) as u32 + 1);
        assert_eq!(hit.file, FileId(0));
        assert_eq!(hit.span, hi - lo);
    }

    let last = *addresses.last().unwrap();
    assert_eq!(table.lookup(last + 0x100).unwrap().span, 0);
    assert!(table.lookup(addresses[0] - 1).is_none());
}

#[test]
fn test_range_map_finds_the_containing_interval()
{
    let mut rng = Rng(0x5eed);
    let mut intervals = Vec::new();
    let mut cursor = 0x1000u64;
    for value in 0..100u32 {
        cursor += rng.below(0x20);
        let hi = cursor + 1 + rng.below(0x40);
        intervals.push(RangeEntry { lo: cursor, hi, value });
        cursor = hi;
    }
    let mut shuffled = intervals.clone();
    shuffled.reverse();
    let map = RangeMap::new(shuffled);

    assert_eq!(map.len(), intervals.len());
    assert!(!map.has_overlaps());
    let sorted: Vec<_> = map.iter().copied().collect();
    assert!(sorted.windows(2).all(|pair| pair[0].hi <= pair[1].lo));

    for address in 0xff0..cursor + 0x10 {
        let expected = intervals.iter().find(|entry| entry.contains(address)).map(|entry| entry.value);
        assert_eq!(map.lookup(address), expected, "address {address:#x}");
    }
}

#[test]
fn test_range_map_prefers_the_innermost_overlap()
{
    let map = RangeMap::new([
        RangeEntry { lo: 0x100, hi: 0x200, value: 'o' },
        RangeEntry { lo: 0x140, hi: 0x160, value: 'i' },
        RangeEntry { lo: 0x300, hi: 0x300, value: 'e' },
    ]);
    assert!(map.has_overlaps());
    assert_eq!(map.len(), 2);
    assert_eq!(map.lookup(0x150), Some('i'));
    assert_eq!(map.lookup(0x170), Some('o'));
    assert_eq!(map.lookup(0x200), None);
}
