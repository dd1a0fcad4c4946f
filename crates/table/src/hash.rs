//! Hash helpers.

/// Multiplier used by [`hash_u64`].
const GOLDEN_RATIO_64: u64 = 0x9e37_ffff_fffc_0001;

/// Avalanche applied to every caller hash before it is reduced to a bucket.
///
/// Caller hash functions are often little more than an identity on small
/// integers; mixing spreads those across the whole bucket array.
pub(crate) fn mix(hash: u32) -> u32 {
	let mut i = hash;
	i = i.wrapping_add(!(i << 9));
	i ^= (i >> 14) | (i << 18);
	i = i.wrapping_add(i << 4);
	i ^= (i >> 10) | (i << 22);
	i
}

/// Multiplicative hash of a 64-bit integer, keeping the high 32 bits.
pub fn hash_u64(value: u64) -> u32 {
	(value.wrapping_mul(GOLDEN_RATIO_64) >> 32) as u32
}

/// Hash of a byte string.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
	let mut hash: u32 = 0;
	for (i, &b) in bytes.iter().enumerate() {
		hash = (hash << 4).wrapping_add(b as u32).wrapping_add(i as u32);
		let top = hash & 0xF000_0000;
		if top != 0 {
			hash ^= top >> 24;
		}
		hash &= !top;
	}
	hash
}
