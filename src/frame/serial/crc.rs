// CRC-16, reflected polynomial 0xA001, initial value 0xFFFF, no final xor

const POLY: u16 = 0xA001;
const INIT: u16 = 0xFFFF;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;

        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

pub fn compute(data: &[u8]) -> u16 {
    data.iter().fold(INIT, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ byte as u16) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute_bitwise(data: &[u8]) -> u16 {
        let mut crc = INIT;

        for &byte in data {
            crc ^= byte as u16;

            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ POLY;
                } else {
                    crc >>= 1;
                }
            }
        }

        crc
    }

    #[test]
    fn check_value() {
        assert_eq!(compute(b"123456789"), 0x4B37);
    }

    #[test]
    fn empty() {
        assert_eq!(compute(&[]), 0xFFFF);
    }

    #[test]
    fn table_matches_bitwise() {
        for _ in 0..64 {
            let len = rand::random::<usize>() % 16;
            let data = (0..len).map(|_| rand::random::<u8>()).collect::<Vec<_>>();

            assert_eq!(compute(&data), compute_bitwise(&data));
        }
    }
}
