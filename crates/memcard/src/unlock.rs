//! Scramblers used to build the unlock challenge.

/// Right-shifting EXNOR feedback register.
pub fn exnor_1st(data: u32, rshift: u32) -> u32 {
    let mut w = data;
    for _ in 0..rshift {
        let wk = !(w ^ (w >> 7) ^ (w >> 15) ^ (w >> 23));
        w = (w >> 1) | ((wk << 30) & 0x4000_0000);
    }
    w
}

/// Left-shifting EXNOR feedback register.
pub fn exnor(data: u32, lshift: u32) -> u32 {
    let mut w = data;
    for _ in 0..lshift {
        let wk = !(w ^ (w << 7) ^ (w << 15) ^ (w << 23));
        w = (w << 1) | ((wk >> 30) & 0x0000_0002);
    }
    w
}

/// Bit permutation applied to challenge words.
///
/// Not a plain reversal: the low half is mirrored into the high half, the
/// high half is folded down, and bit 31 lands in bit 0.
pub fn bitrev(data: u32) -> u32 {
    let mut wk = 0u32;
    let mut j = 1u32;
    let mut k = 0u32;
    for i in 0..32u32 {
        if i > 15 {
            if i == 31 {
                wk |= (data >> 31) & 1;
            } else {
                wk |= (data & (1 << i)) >> j;
                j += 2;
            }
        } else {
            wk |= (data & (1 << i)) << (31 - i - k);
            k += 1;
        }
    }
    wk
}

/// Linear congruential generator of the unlock sequence.
#[derive(Debug, Clone)]
pub struct CardRand {
    next: u32,
}

impl CardRand {
    pub fn new(seed: u32) -> Self {
        Self { next: seed }
    }

    pub fn next_value(&mut self) -> u32 {
        self.next = self.next.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (self.next / 65_536) % 32_768
    }
}

/// Scrambled challenge word sent with the unlock handshake.
pub fn challenge(seed: u32, latency: u32) -> u32 {
    let mut rand = CardRand::new(seed);
    let data = (rand.next_value() << 16) | rand.next_value();
    bitrev(exnor_1st(data, latency * 8 + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scramblers_match_reference_values() {
        assert_eq!(exnor_1st(0x1234_5678, 8), 0x3392_3456);
        assert_eq!(exnor(0x1234_5678, 8), 0x3456_79C0);
        assert_eq!(bitrev(0x1234_5678), 0x1E6A_2C48);
        assert_eq!(bitrev(1), 0x8000_0000);
        assert_eq!(bitrev(0x8000_0000), 1);
    }

    #[test]
    fn rand_sequence_from_seed_one() {
        let mut rand = CardRand::new(1);
        assert_eq!(rand.next_value(), 16838);
        assert_eq!(rand.next_value(), 5758);
    }

    #[test]
    fn challenge_is_deterministic() {
        assert_eq!(challenge(7, 4), challenge(7, 4));
        assert_ne!(challenge(7, 4), challenge(8, 4));
    }
}
