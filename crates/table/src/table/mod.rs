//! The [`KeyedTable`] container.

use std::mem;
use std::ops::{AddAssign, SubAssign};

use crate::hash::mix;
use crate::{Result, TableError};

/// Caller-supplied hash function.
pub type HashFn<K> = fn(&K) -> u32;

/// Caller-supplied equality predicate.
pub type EqFn<K> = fn(&K, &K) -> bool;

/// Largest accepted `min_size`.
pub const MAX_MIN_SIZE: usize = 1 << 30;

/// Bucket counts, each roughly double the previous.
const PRIMES: [usize; 26] = [
	53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317, 196613, 393241,
	786433, 1572869, 3145739, 6291469, 12582917, 25165843, 50331653, 100663319, 201326611,
	402653189, 805306457, 1610612741,
];

/// Entry count above which the table grows, 65% of the matching prime.
const LOAD_LIMITS: [usize; 26] = [
	35, 64, 126, 253, 500, 1003, 2002, 3999, 7988, 15986, 31953, 63907, 127799, 255607, 511182,
	1022365, 2044731, 4089455, 8178897, 16357798, 32715575, 65431158, 130862298, 261724573,
	523449198, 1046898282,
];

struct Entry<K, V> {
	key: K,
	value: V,
	hash: u32,
	next: Option<usize>,
}

enum Slot<K, V> {
	Occupied(Entry<K, V>),
	/// Free slot, linking to the next free one.
	Vacant(Option<usize>),
}

/// Allocation points that tests can force to fail.
#[derive(Debug, Default)]
pub(crate) struct Faults {
	pub(crate) entry: bool,
	pub(crate) fresh_buckets: bool,
	pub(crate) in_place: bool,
}

/// Hashtable with chained buckets and a prime-ladder bucket array.
///
/// Duplicate keys are accepted. Until the table grows, lookups return the
/// most recently inserted match; growth reverses chains, so afterwards no
/// order among duplicates is guaranteed.
pub struct KeyedTable<K, V> {
	buckets: Vec<Option<usize>>,
	slots: Vec<Slot<K, V>>,
	free: Option<usize>,
	len: usize,
	prime_index: usize,
	load_limit: usize,
	hash_fn: HashFn<K>,
	eq_fn: EqFn<K>,
	pub(crate) faults: Faults,
}

impl<K, V> KeyedTable<K, V> {
	/// Creates an empty table with at least `min_size` buckets.
	///
	/// # Errors
	///
	/// Returns [`TableError::TooLarge`] when `min_size` exceeds [`MAX_MIN_SIZE`]
	/// and [`TableError::OutOfMemory`] when the bucket array cannot be allocated.
	pub fn new(min_size: usize, hash_fn: HashFn<K>, eq_fn: EqFn<K>) -> Result<Self> {
		if min_size > MAX_MIN_SIZE {
			return Err(TableError::TooLarge(min_size));
		}
		let prime_index = PRIMES
			.iter()
			.position(|&p| p >= min_size)
			.ok_or(TableError::TooLarge(min_size))?;

		let mut buckets = Vec::new();
		buckets
			.try_reserve_exact(PRIMES[prime_index])
			.map_err(|_| TableError::OutOfMemory)?;
		buckets.resize(PRIMES[prime_index], None);

		Ok(Self {
			buckets,
			slots: Vec::new(),
			free: None,
			len: 0,
			prime_index,
			load_limit: LOAD_LIMITS[prime_index],
			hash_fn,
			eq_fn,
			faults: Faults::default(),
		})
	}

	/// Number of stored entries.
	pub fn len(&self) -> usize {
		self.len
	}

	/// Returns `true` if the table holds no entries.
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Current bucket count.
	pub fn capacity(&self) -> usize {
		self.buckets.len()
	}

	/// Inserts `key` without checking for an existing entry.
	///
	/// # Errors
	///
	/// Returns [`TableError::OutOfMemory`] if no entry slot can be allocated.
	/// A failed growth is not an error.
	pub fn insert(&mut self, key: K, value: V) -> Result<()> {
		self.len += 1;
		if self.len > self.load_limit {
			self.grow();
		}

		let slot = match self.alloc_slot() {
			Ok(slot) => slot,
			Err(e) => {
				self.len -= 1;
				return Err(e);
			}
		};

		let hash = self.hash(&key);
		let index = index_for(hash, self.buckets.len());
		self.slots[slot] = Slot::Occupied(Entry {
			key,
			value,
			hash,
			next: self.buckets[index],
		});
		self.buckets[index] = Some(slot);
		Ok(())
	}

	/// Returns the value of the first entry matching `key`.
	pub fn search(&self, key: &K) -> Option<&V> {
		self.find(key).map(|i| &self.entry(i).value)
	}

	/// Mutable variant of [`search`](Self::search).
	pub fn search_mut(&mut self, key: &K) -> Option<&mut V> {
		let i = self.find(key)?;
		Some(&mut self.entry_mut(i).value)
	}

	/// Returns `true` if some entry matches `key`.
	pub fn contains(&self, key: &K) -> bool {
		self.find(key).is_some()
	}

	/// Removes the first match and returns its value, dropping the stored key.
	pub fn remove(&mut self, key: &K) -> Option<V> {
		self.remove_entry(key).map(|(_, v)| v)
	}

	/// Removes the first match and returns both stored key and value.
	pub fn remove_entry(&mut self, key: &K) -> Option<(K, V)> {
		let hash = self.hash(key);
		let index = index_for(hash, self.buckets.len());

		let mut prev: Option<usize> = None;
		let mut cur = self.buckets[index];
		while let Some(i) = cur {
			let entry = self.entry(i);
			let next = entry.next;
			if entry.hash == hash && (self.eq_fn)(key, &entry.key) {
				match prev {
					Some(p) => self.entry_mut(p).next = next,
					None => self.buckets[index] = next,
				}
				let entry = self.release_slot(i);
				self.len -= 1;
				return Some((entry.key, entry.value));
			}
			prev = cur;
			cur = next;
		}
		None
	}

	/// Replaces the value of the first match, returning the previous value.
	///
	/// Returns `None` and stores nothing when `key` is absent.
	pub fn change(&mut self, key: &K, value: V) -> Option<V> {
		self.search_mut(key).map(|v| mem::replace(v, value))
	}

	/// Adds `delta` to the value of the first match.
	pub fn increment(&mut self, key: &K, delta: V) -> bool
	where
		V: AddAssign,
	{
		match self.search_mut(key) {
			Some(v) => {
				*v += delta;
				true
			}
			None => false,
		}
	}

	/// Subtracts `delta` from the value of the first match.
	pub fn decrement(&mut self, key: &K, delta: V) -> bool
	where
		V: SubAssign,
	{
		match self.search_mut(key) {
			Some(v) => {
				*v -= delta;
				true
			}
			None => false,
		}
	}

	/// Keeps only the entries for which `keep` returns `true`.
	pub fn retain(&mut self, mut keep: impl FnMut(&K, &mut V) -> bool) {
		for index in 0..self.buckets.len() {
			let mut prev: Option<usize> = None;
			let mut cur = self.buckets[index];
			while let Some(i) = cur {
				let entry = self.entry_mut(i);
				let next = entry.next;
				if keep(&entry.key, &mut entry.value) {
					prev = cur;
				} else {
					match prev {
						Some(p) => self.entry_mut(p).next = next,
						None => self.buckets[index] = next,
					}
					self.release_slot(i);
					self.len -= 1;
				}
				cur = next;
			}
		}
	}

	/// Removes every entry, handing them back in unspecified order.
	pub fn drain(&mut self) -> Vec<(K, V)> {
		let slots = mem::take(&mut self.slots);
		self.reset();
		slots
			.into_iter()
			.filter_map(|slot| match slot {
				Slot::Occupied(e) => Some((e.key, e.value)),
				Slot::Vacant(_) => None,
			})
			.collect()
	}

	/// Drops every entry. The bucket array keeps its current size.
	pub fn clear(&mut self) {
		self.slots.clear();
		self.reset();
	}

	/// Iterates over all entries in unspecified order.
	pub fn iter(&self) -> Iter<'_, K, V> {
		Iter {
			slots: self.slots.iter(),
		}
	}

	fn reset(&mut self) {
		self.buckets.iter_mut().for_each(|b| *b = None);
		self.free = None;
		self.len = 0;
	}

	fn hash(&self, key: &K) -> u32 {
		mix((self.hash_fn)(key))
	}

	fn find(&self, key: &K) -> Option<usize> {
		let hash = self.hash(key);
		let mut cur = self.buckets[index_for(hash, self.buckets.len())];
		while let Some(i) = cur {
			let entry = self.entry(i);
			if entry.hash == hash && (self.eq_fn)(key, &entry.key) {
				return Some(i);
			}
			cur = entry.next;
		}
		None
	}

	fn entry(&self, i: usize) -> &Entry<K, V> {
		match &self.slots[i] {
			Slot::Occupied(e) => e,
			Slot::Vacant(_) => unreachable!("vacant slot {i} linked into a chain"),
		}
	}

	fn entry_mut(&mut self, i: usize) -> &mut Entry<K, V> {
		match &mut self.slots[i] {
			Slot::Occupied(e) => e,
			Slot::Vacant(_) => unreachable!("vacant slot {i} linked into a chain"),
		}
	}

	fn alloc_slot(&mut self) -> Result<usize> {
		if let Some(i) = self.free {
			if let Slot::Vacant(next) = self.slots[i] {
				self.free = next;
			}
			return Ok(i);
		}

		if self.faults.entry {
			return Err(TableError::OutOfMemory);
		}
		self.slots
			.try_reserve(1)
			.map_err(|_| TableError::OutOfMemory)?;
		self.slots.push(Slot::Vacant(None));
		Ok(self.slots.len() - 1)
	}

	fn release_slot(&mut self, i: usize) -> Entry<K, V> {
		let slot = mem::replace(&mut self.slots[i], Slot::Vacant(self.free));
		self.free = Some(i);
		match slot {
			Slot::Occupied(e) => e,
			Slot::Vacant(_) => unreachable!("released vacant slot {i}"),
		}
	}

	/// Moves to the next prime, rehashing into a fresh bucket array if one
	/// can be allocated and re-bucketing in place otherwise. On total failure
	/// the table keeps its current size.
	fn grow(&mut self) {
		if self.prime_index + 1 >= PRIMES.len() {
			return;
		}
		self.prime_index += 1;
		let new_len = PRIMES[self.prime_index];

		if let Some(mut fresh) = self.fresh_buckets(new_len) {
			for index in 0..self.buckets.len() {
				let mut cur = self.buckets[index];
				while let Some(i) = cur {
					let entry = self.entry_mut(i);
					cur = entry.next;
					let target = index_for(entry.hash, new_len);
					entry.next = fresh[target];
					fresh[target] = Some(i);
				}
			}
			self.buckets = fresh;
		} else if self.extend_buckets(new_len) {
			self.rebucket_in_place();
		} else {
			self.prime_index -= 1;
			return;
		}
		self.load_limit = LOAD_LIMITS[self.prime_index];
	}

	fn fresh_buckets(&self, len: usize) -> Option<Vec<Option<usize>>> {
		if self.faults.fresh_buckets {
			return None;
		}
		let mut fresh = Vec::new();
		fresh.try_reserve_exact(len).ok()?;
		fresh.resize(len, None);
		Some(fresh)
	}

	fn extend_buckets(&mut self, len: usize) -> bool {
		if self.faults.in_place {
			return false;
		}
		if self
			.buckets
			.try_reserve_exact(len - self.buckets.len())
			.is_err()
		{
			return false;
		}
		self.buckets.resize(len, None);
		true
	}

	/// Moves entries whose index changed after the bucket array was extended.
	/// Only the old buckets can hold entries, so the new tail starts empty.
	fn rebucket_in_place(&mut self) {
		let len = self.buckets.len();
		let old_len = PRIMES[self.prime_index - 1];
		for index in 0..old_len {
			let mut prev: Option<usize> = None;
			let mut cur = self.buckets[index];
			while let Some(i) = cur {
				let entry = self.entry(i);
				let next = entry.next;
				let target = index_for(entry.hash, len);
				if target == index {
					prev = cur;
				} else {
					match prev {
						Some(p) => self.entry_mut(p).next = next,
						None => self.buckets[index] = next,
					}
					self.entry_mut(i).next = self.buckets[target];
					self.buckets[target] = Some(i);
				}
				cur = next;
			}
		}
	}
}

impl<K, V> std::fmt::Debug for KeyedTable<K, V> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KeyedTable")
			.field("len", &self.len)
			.field("buckets", &self.buckets.len())
			.finish()
	}
}

/// Iterator over the entries of a [`KeyedTable`].
pub struct Iter<'a, K, V> {
	slots: std::slice::Iter<'a, Slot<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
	type Item = (&'a K, &'a V);

	fn next(&mut self) -> Option<Self::Item> {
		for slot in self.slots.by_ref() {
			if let Slot::Occupied(e) = slot {
				return Some((&e.key, &e.value));
			}
		}
		None
	}
}

fn index_for(hash: u32, len: usize) -> usize {
	hash as usize % len
}
