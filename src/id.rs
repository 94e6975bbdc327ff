//! 256-bit node and fragment identifiers.
//!
//! Identifiers are unsigned 256-bit integers stored as eight 32-bit limbs
//! in little-endian order. The overlay only needs XOR, equality and
//! count-leading-zeros to navigate the id space; the remaining arithmetic
//! (ordering, shifts, add/sub/mul/div) is provided for callers that derive
//! ids from application data.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, BitXor, BitXorAssign, Mul, Shl, Shr, Sub};

use rand::Rng as _;
use thiserror::Error;

/// Number of 32-bit limbs in an id.
const WIDTH: usize = 8;

/// Width of an id in bits.
pub const ID_BITS: u32 = 256;

/// Returned by [`NodeId::checked_div`] when the divisor is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("division by zero")]
pub struct DivisionByZero;

/// A 256-bit overlay identifier.
///
/// Construction is total; all operations are infallible except division.
/// Addition, subtraction and multiplication wrap modulo 2^256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeId {
    /// `limbs[0]` is the least significant limb.
    limbs: [u32; WIDTH],
}

/// Fragment keys share the node id space.
pub type FragmentId = NodeId;

impl NodeId {
    pub const ZERO: NodeId = NodeId { limbs: [0; WIDTH] };

    /// Generates a uniformly random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        Self::from_le_bytes(bytes)
    }

    /// Builds an id from its 32-byte little-endian representation.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        let mut limbs = [0u32; WIDTH];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut chunk = [0u8; 4];
            chunk.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            *limb = u32::from_le_bytes(chunk);
        }
        Self { limbs }
    }

    /// The 32-byte little-endian representation, as sent on the wire.
    pub fn to_le_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, limb) in self.limbs.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&limb.to_le_bytes());
        }
        bytes
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    /// Count of leading zero bits; `256` when the id is zero.
    pub fn leading_zeros(&self) -> u32 {
        let mut count = 0;
        for &limb in self.limbs.iter().rev() {
            if limb == 0 {
                count += 32;
            } else {
                count += limb.leading_zeros();
                break;
            }
        }
        count
    }

    /// Position of the highest set bit plus one; `0` when the id is zero.
    pub fn bits(&self) -> u32 {
        ID_BITS - self.leading_zeros()
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        *self ^ *other
    }

    /// Index of the k-bucket `other` falls into relative to `self`:
    /// the position of the highest bit in which the two ids differ.
    /// `None` when the ids are equal, which is not a routable distance.
    pub fn bucket_index(&self, other: &NodeId) -> Option<u16> {
        let clz = self.distance(other).leading_zeros();
        if clz == ID_BITS {
            None
        } else {
            Some((ID_BITS - 1 - clz) as u16)
        }
    }

    /// Division, failing on a zero divisor.
    pub fn checked_div(&self, divisor: &NodeId) -> Result<NodeId, DivisionByZero> {
        if divisor.is_zero() {
            return Err(DivisionByZero);
        }

        let mut quotient = NodeId::ZERO;
        let mut num = *self;
        let num_bits = num.bits();
        let div_bits = divisor.bits();
        if div_bits > num_bits {
            return Ok(quotient);
        }

        // Shift-and-subtract long division.
        let mut shift = (num_bits - div_bits) as i32;
        let mut div = *divisor << shift as u32;
        while shift >= 0 {
            if num >= div {
                num = num - div;
                quotient.limbs[(shift / 32) as usize] |= 1 << (shift & 31);
            }
            div = div >> 1;
            shift -= 1;
        }
        Ok(quotient)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        let mut limbs = [0u32; WIDTH];
        limbs[0] = value as u32;
        limbs[1] = (value >> 32) as u32;
        Self { limbs }
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in (0..WIDTH).rev() {
            match self.limbs[i].cmp(&other.limbs[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(mut self, rhs: NodeId) -> NodeId {
        self ^= rhs;
        self
    }
}

impl BitXorAssign for NodeId {
    fn bitxor_assign(&mut self, rhs: NodeId) {
        for (l, r) in self.limbs.iter_mut().zip(rhs.limbs.iter()) {
            *l ^= r;
        }
    }
}

impl Add for NodeId {
    type Output = NodeId;

    fn add(self, rhs: NodeId) -> NodeId {
        let mut out = NodeId::ZERO;
        let mut carry = 0u64;
        for i in 0..WIDTH {
            let sum = carry + self.limbs[i] as u64 + rhs.limbs[i] as u64;
            out.limbs[i] = sum as u32;
            carry = sum >> 32;
        }
        out
    }
}

impl Sub for NodeId {
    type Output = NodeId;

    fn sub(self, rhs: NodeId) -> NodeId {
        // Two's complement: a - b = a + !b + 1.
        let mut negated = NodeId::ZERO;
        for i in 0..WIDTH {
            negated.limbs[i] = !rhs.limbs[i];
        }
        self + negated + NodeId::from(1u64)
    }
}

impl Mul for NodeId {
    type Output = NodeId;

    fn mul(self, rhs: NodeId) -> NodeId {
        let mut out = NodeId::ZERO;
        for j in 0..WIDTH {
            let mut carry = 0u64;
            for i in 0..WIDTH - j {
                let n =
                    carry + out.limbs[i + j] as u64 + self.limbs[j] as u64 * rhs.limbs[i] as u64;
                out.limbs[i + j] = n as u32;
                carry = n >> 32;
            }
        }
        out
    }
}

impl Shl<u32> for NodeId {
    type Output = NodeId;

    fn shl(self, shift: u32) -> NodeId {
        let mut out = NodeId::ZERO;
        let limb_shift = (shift / 32) as usize;
        let bit_shift = shift % 32;
        for i in 0..WIDTH {
            if i + limb_shift + 1 < WIDTH && bit_shift != 0 {
                out.limbs[i + limb_shift + 1] |= self.limbs[i] >> (32 - bit_shift);
            }
            if i + limb_shift < WIDTH {
                out.limbs[i + limb_shift] |= self.limbs[i] << bit_shift;
            }
        }
        out
    }
}

impl Shr<u32> for NodeId {
    type Output = NodeId;

    fn shr(self, shift: u32) -> NodeId {
        let mut out = NodeId::ZERO;
        let limb_shift = (shift / 32) as usize;
        let bit_shift = shift % 32;
        for i in 0..WIDTH {
            if i >= limb_shift + 1 && bit_shift != 0 {
                out.limbs[i - limb_shift - 1] |= self.limbs[i] << (32 - bit_shift);
            }
            if i >= limb_shift {
                out.limbs[i - limb_shift] |= self.limbs[i] >> bit_shift;
            }
        }
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:08x}..)", self.limbs[WIDTH - 1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for limb in self.limbs.iter().rev() {
            write!(f, "{:08x}", limb)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: u64) -> NodeId {
        NodeId::from(value)
    }

    #[test]
    fn generate_is_random() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    #[test]
    fn le_bytes_round_trip() {
        let a = NodeId::generate();
        assert_eq!(NodeId::from_le_bytes(a.to_le_bytes()), a);
    }

    #[test]
    fn byte_order_is_little_endian() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x2a;
        assert_eq!(NodeId::from_le_bytes(bytes), id(0x2a));
    }

    #[test]
    fn leading_zeros_of_zero_is_width() {
        assert_eq!(NodeId::ZERO.leading_zeros(), 256);
        assert_eq!(NodeId::ZERO.bits(), 0);
    }

    #[test]
    fn leading_zeros_and_bits() {
        assert_eq!(id(1).leading_zeros(), 255);
        assert_eq!(id(1).bits(), 1);
        assert_eq!(id(0x80).leading_zeros(), 248);
        assert_eq!(id(0x80).bits(), 8);

        let top = id(1) << 255;
        assert_eq!(top.leading_zeros(), 0);
        assert_eq!(top.bits(), 256);
    }

    #[test]
    fn xor_is_its_own_inverse() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a ^ b ^ b, a);
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn bucket_index_is_symmetric() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a.bucket_index(&b), b.bucket_index(&a));
    }

    #[test]
    fn bucket_index_of_self_is_invalid() {
        let a = NodeId::generate();
        assert_eq!(a.bucket_index(&a), None);
    }

    #[test]
    fn bucket_index_is_highest_differing_bit() {
        assert_eq!(id(1).bucket_index(&id(2)), Some(1));
        assert_eq!(id(0).bucket_index(&id(1)), Some(0));

        let top = id(1) << 255;
        assert_eq!(NodeId::ZERO.bucket_index(&top), Some(255));
    }

    #[test]
    fn ordering_compares_magnitude() {
        assert!(id(1) < id(2));
        assert!(id(1) << 200 > id(u64::MAX));
    }

    #[test]
    fn add_sub_round_trip() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a + b - b, a);
    }

    #[test]
    fn shifts_are_inverse_on_low_values() {
        let a = id(0xdead_beef);
        assert_eq!(a << 100 >> 100, a);
    }

    #[test]
    fn multiplication() {
        assert_eq!(id(6) * id(7), id(42));
        let big = id(1) << 128;
        assert_eq!(big * big, NodeId::ZERO); // wraps modulo 2^256
    }

    #[test]
    fn division() {
        assert_eq!(id(42).checked_div(&id(6)).unwrap(), id(7));
        assert_eq!(id(41).checked_div(&id(6)).unwrap(), id(6));
        assert_eq!(id(5).checked_div(&id(10)).unwrap(), id(0));

        let big = id(1) << 200;
        assert_eq!(big.checked_div(&(id(1) << 100)).unwrap(), id(1) << 100);
    }

    #[test]
    fn division_by_zero_fails() {
        assert_eq!(id(1).checked_div(&NodeId::ZERO), Err(DivisionByZero));
    }

    #[test]
    fn display_is_full_hex() {
        let s = id(0xff).to_string();
        assert_eq!(s.len(), 64);
        assert!(s.ends_with("ff"));
        assert!(s.starts_with("00"));
    }
}
