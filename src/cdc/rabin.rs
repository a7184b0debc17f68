//! Polynomial (Rabin-Karp style) rolling hash over a fixed byte window.

pub const RABIN_WINDOW: usize = 48;

const PRIME: u64 = 0x3DA3_358B_4DC1_73;

pub struct RollingHash {
    hash:   u64,
    window: [u8; RABIN_WINDOW],
    filled: usize,
    pos:    usize,
    /// PRIME^RABIN_WINDOW, used to remove the byte leaving the window.
    pow:    u64,
}

impl RollingHash {
    pub fn new() -> Self {
        let mut pow = 1u64;
        for _ in 0..RABIN_WINDOW {
            pow = pow.wrapping_mul(PRIME);
        }
        Self { hash: 0, window: [0; RABIN_WINDOW], filled: 0, pos: 0, pow }
    }

    pub fn reset(&mut self) {
        self.hash = 0;
        self.filled = 0;
        self.pos = 0;
    }

    #[inline]
    pub fn update(&mut self, byte: u8) -> u64 {
        self.hash = self.hash.wrapping_mul(PRIME).wrapping_add(u64::from(byte));
        if self.filled < RABIN_WINDOW {
            self.filled += 1;
        } else {
            let old = self.window[self.pos];
            self.hash = self.hash.wrapping_sub(u64::from(old).wrapping_mul(self.pow));
        }
        self.window[self.pos] = byte;
        self.pos = (self.pos + 1) % RABIN_WINDOW;
        self.hash
    }
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_slides() {
        // Same trailing window, different history: same hash.
        let tail: Vec<u8> = (0..RABIN_WINDOW as u8).collect();
        let mut a = RollingHash::new();
        let mut b = RollingHash::new();
        for &x in b"some earlier bytes" {
            a.update(x);
        }
        for &x in b"completely different prefix, longer" {
            b.update(x);
        }
        let (mut ha, mut hb) = (0, 0);
        for &x in &tail {
            ha = a.update(x);
            hb = b.update(x);
        }
        assert_eq!(ha, hb);
    }

    #[test]
    fn test_reset_matches_fresh() {
        let mut a = RollingHash::new();
        for &x in b"xyz" {
            a.update(x);
        }
        a.reset();
        let mut b = RollingHash::new();
        assert_eq!(a.update(9), b.update(9));
    }
}
