//! CRC primitives for the wire format. Both functions fold the seed in
//! zlib-style (complemented on the way in and out), so a checksum can be
//! extended incrementally: `crc32(rest, crc32(prefix, seed))` equals
//! `crc32(whole, seed)`.

use crc32fast::Hasher;

/// CRC-32 (IEEE polynomial) over `data`, continuing from `seed`.
#[inline]
pub fn crc32(data: &[u8], seed: u32) -> u32 {
    let mut hasher = Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// CRC-16 over `data`, continuing from `seed`.
pub fn crc16(data: &[u8], seed: u16) -> u16 {
    let mut crc = !seed;

    for &byte in data {
        crc = (crc >> 8) ^ CRC16_TABLE[((crc ^ u16::from(byte)) & 0xff) as usize];
    }

    !crc
}

// Byte-at-a-time table for the 0x1021 polynomial, low bit first.
const CRC16_TABLE: [u16; 256] = [
    0x0000, 0x17ce, 0x0fdf, 0x1811, 0x1fbe, 0x0870, 0x1061, 0x07af,
    0x1f3f, 0x08f1, 0x10e0, 0x072e, 0x0081, 0x174f, 0x0f5e, 0x1890,
    0x1e3d, 0x09f3, 0x11e2, 0x062c, 0x0183, 0x164d, 0x0e5c, 0x1992,
    0x0102, 0x16cc, 0x0edd, 0x1913, 0x1ebc, 0x0972, 0x1163, 0x06ad,
    0x1c39, 0x0bf7, 0x13e6, 0x0428, 0x0387, 0x1449, 0x0c58, 0x1b96,
    0x0306, 0x14c8, 0x0cd9, 0x1b17, 0x1cb8, 0x0b76, 0x1367, 0x04a9,
    0x0204, 0x15ca, 0x0ddb, 0x1a15, 0x1dba, 0x0a74, 0x1265, 0x05ab,
    0x1d3b, 0x0af5, 0x12e4, 0x052a, 0x0285, 0x154b, 0x0d5a, 0x1a94,
    0x1831, 0x0fff, 0x17ee, 0x0020, 0x078f, 0x1041, 0x0850, 0x1f9e,
    0x070e, 0x10c0, 0x08d1, 0x1f1f, 0x18b0, 0x0f7e, 0x176f, 0x00a1,
    0x060c, 0x11c2, 0x09d3, 0x1e1d, 0x19b2, 0x0e7c, 0x166d, 0x01a3,
    0x1933, 0x0efd, 0x16ec, 0x0122, 0x068d, 0x1143, 0x0952, 0x1e9c,
    0x0408, 0x13c6, 0x0bd7, 0x1c19, 0x1bb6, 0x0c78, 0x1469, 0x03a7,
    0x1b37, 0x0cf9, 0x14e8, 0x0326, 0x0489, 0x1347, 0x0b56, 0x1c98,
    0x1a35, 0x0dfb, 0x15ea, 0x0224, 0x058b, 0x1245, 0x0a54, 0x1d9a,
    0x050a, 0x12c4, 0x0ad5, 0x1d1b, 0x1ab4, 0x0d7a, 0x156b, 0x02a5,
    0x1021, 0x07ef, 0x1ffe, 0x0830, 0x0f9f, 0x1851, 0x0040, 0x178e,
    0x0f1e, 0x18d0, 0x00c1, 0x170f, 0x10a0, 0x076e, 0x1f7f, 0x08b1,
    0x0e1c, 0x19d2, 0x01c3, 0x160d, 0x11a2, 0x066c, 0x1e7d, 0x09b3,
    0x1123, 0x06ed, 0x1efc, 0x0932, 0x0e9d, 0x1953, 0x0142, 0x168c,
    0x0c18, 0x1bd6, 0x03c7, 0x1409, 0x13a6, 0x0468, 0x1c79, 0x0bb7,
    0x1327, 0x04e9, 0x1cf8, 0x0b36, 0x0c99, 0x1b57, 0x0346, 0x1488,
    0x1225, 0x05eb, 0x1dfa, 0x0a34, 0x0d9b, 0x1a55, 0x0244, 0x158a,
    0x0d1a, 0x1ad4, 0x02c5, 0x150b, 0x12a4, 0x056a, 0x1d7b, 0x0ab5,
    0x0810, 0x1fde, 0x07cf, 0x1001, 0x17ae, 0x0060, 0x1871, 0x0fbf,
    0x172f, 0x00e1, 0x18f0, 0x0f3e, 0x0891, 0x1f5f, 0x074e, 0x1080,
    0x162d, 0x01e3, 0x19f2, 0x0e3c, 0x0993, 0x1e5d, 0x064c, 0x1182,
    0x0912, 0x1edc, 0x06cd, 0x1103, 0x16ac, 0x0162, 0x1973, 0x0ebd,
    0x1429, 0x03e7, 0x1bf6, 0x0c38, 0x0b97, 0x1c59, 0x0448, 0x1386,
    0x0b16, 0x1cd8, 0x04c9, 0x1307, 0x14a8, 0x0366, 0x1b77, 0x0cb9,
    0x0a14, 0x1dda, 0x05cb, 0x1205, 0x15aa, 0x0264, 0x1a75, 0x0dbb,
    0x152b, 0x02e5, 0x1af4, 0x0d3a, 0x0a95, 0x1d5b, 0x054a, 0x1284,
];

#[cfg(test)]
mod tests {
    use super::*;

    const VECTORS: &[(&[u8], u32, u16)] = &[
        (b"", 0x0000_0000, 0x0000),
        (b"\x00", 0xd202_ef8d, 0xed84),
        (b"covfefe", 0xf62c_d904, 0xe1a7),
        (b"\x00\x00\x00\x00\x00\x00\x00\x00", 0x6522_df69, 0xf4ae),
        (b"abcdefghijklmnopqrstuvwxyz", 0x4c27_50bd, 0xe4a5),
        (
            b"The quick brown fox jumps over the lazy dog.",
            0x5190_25e9,
            0xfa25,
        ),
    ];

    #[test]
    fn test_known_vectors() {
        for &(data, expected32, expected16) in VECTORS {
            assert_eq!(crc32(data, 0), expected32);
            assert_eq!(crc16(data, 0), expected16);
        }
    }

    #[test]
    fn test_incremental_bytewise() {
        for &(data, expected32, expected16) in VECTORS {
            let mut running32 = 0;
            let mut running16 = 0;

            for index in 0..data.len() {
                running32 = crc32(&data[index..=index], running32);
                running16 = crc16(&data[index..=index], running16);
            }

            assert_eq!(running32, expected32);
            assert_eq!(running16, expected16);
        }
    }

    #[test]
    fn test_incremental_split() {
        let data: &[u8] = b"The quick brown fox jumps over the lazy dog.";

        for split in 0..data.len() {
            let (head, tail) = data.split_at(split);
            assert_eq!(crc32(tail, crc32(head, 0)), 0x5190_25e9);
            assert_eq!(crc16(tail, crc16(head, 0)), 0xfa25);
        }
    }
}
