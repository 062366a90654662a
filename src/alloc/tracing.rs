//! An allocator decorator that remembers every live block.
//!
//! Each block handed out by the inner allocator gets a [`TraceRecord`]: a
//! sequence number, where it is and how big it is. The live set can be
//! queried (including by interior pointer), dumped as hex, and exported as
//! JSON for offline inspection.
//!
//! ```no_run
//! use allocstack::{alloc::{tracing::TracingAllocator, global::HeapAllocator, Allocator}, units::{Alignment, Bytes}};
//!
//! let alloc = TracingAllocator::new(HeapAllocator);
//! let block = alloc.allocate(Bytes::new(64), Alignment::DEFAULT);
//! alloc.write_to_file("live.json").unwrap();
//! ```

use std::{
    cell::{Cell, RefCell},
    fmt,
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

use ahash::RandomState;
use hashbrown::HashMap;
use log::trace;
use serde::{Deserialize, Serialize};

use crate::{
    alloc::{Allocator, DeallocateAll, Owns, Rewind},
    serialize::serde_usize,
    span::{ByteSpan, RWByteSpan},
    units::{Address, Alignment, Bytes},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Allocation sequence number, starting at 0
    pub id: u64,
    /// Where is this allocation?
    #[serde(with = "serde_usize")]
    pub address: Address,
    /// How big is it?
    pub size: Bytes,
    pub alignment: Alignment,
}

impl TraceRecord {
    /// Is `addr` inside this allocation?
    pub fn contains(&self, addr: Address) -> bool {
        self.address <= addr && addr < self.address.add(self.size)
    }
}

/// Every live allocation at some point in time, ordered by address
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSnapshot {
    pub live: Vec<TraceRecord>,
    pub live_bytes: Bytes,
}

impl TraceSnapshot {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TraceFileError> {
        let mut json = String::new();
        File::open(path)?.read_to_string(&mut json)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum TraceFileError {
    IoError(io::Error),
    SerdeJsonError(serde_json::Error),
}

impl fmt::Display for TraceFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceFileError::IoError(e) => write!(f, "trace file i/o: {e}"),
            TraceFileError::SerdeJsonError(e) => write!(f, "trace file json: {e}"),
        }
    }
}

impl std::error::Error for TraceFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TraceFileError::IoError(e) => Some(e),
            TraceFileError::SerdeJsonError(e) => Some(e),
        }
    }
}

impl From<io::Error> for TraceFileError {
    fn from(e: io::Error) -> Self {
        TraceFileError::IoError(e)
    }
}

impl From<serde_json::Error> for TraceFileError {
    fn from(e: serde_json::Error) -> Self {
        TraceFileError::SerdeJsonError(e)
    }
}

/// The bytes of one allocation
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct HexDump {
    buf: Vec<u8>,
}

impl HexDump {
    pub const fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for HexDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, byte) in self.buf.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        write!(f, "]")
    }
}

/// See the [module docs](self).
pub struct TracingAllocator<A> {
    inner: A,
    live: RefCell<HashMap<Address, TraceRecord, RandomState>>,
    next_id: Cell<u64>,
}

impl<A> TracingAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            live: RefCell::new(HashMap::default()),
            next_id: Cell::new(0),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Number of live allocations
    pub fn nr_allocations(&self) -> usize {
        self.live.borrow().len()
    }

    /// The live allocation starting exactly at `addr`
    pub fn get(&self, addr: Address) -> Option<TraceRecord> {
        self.live.borrow().get(&addr).copied()
    }

    /// The live allocation `addr` points into, if any
    pub fn find(&self, addr: Address) -> Option<TraceRecord> {
        if let Some(exact) = self.get(addr) {
            return Some(exact);
        }
        self.live
            .borrow()
            .values()
            .find(|record| record.contains(addr))
            .copied()
    }

    pub fn snapshot(&self) -> TraceSnapshot {
        let mut live: Vec<TraceRecord> = self.live.borrow().values().copied().collect();
        live.sort_by_key(|record| record.address);
        let live_bytes = live.iter().fold(Bytes::ZERO, |acc, r| acc + r.size);
        TraceSnapshot { live, live_bytes }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), TraceFileError> {
        let json = self.to_json()?;
        File::create(path)?.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Copy out the bytes of the live allocation starting at `addr`.
    ///
    /// # Safety
    ///
    /// The allocation's bytes must be initialized and not being written.
    pub unsafe fn dump(&self, addr: Address) -> Option<HexDump> {
        let record = self.get(addr)?;
        let span = ByteSpan::from_raw_parts(record.address.as_ptr(), record.size);
        Some(HexDump::new(unsafe { span.as_slice() }.to_vec()))
    }
}

impl<A: Allocator> Allocator for TracingAllocator<A> {
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        let block = self.inner.allocate(size, alignment);
        if block.is_empty() {
            if !size.is_zero() {
                trace!("allocate({size}, {alignment}) failed");
            }
            return block;
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let record = TraceRecord {
            id,
            address: block.begin(),
            size: block.len(),
            alignment,
        };
        trace!("allocate({size}, {alignment}) #{id} -> {block:?}");
        let previous = self.live.borrow_mut().insert(record.address, record);
        debug_assert!(previous.is_none(), "{block:?} handed out twice");
        block
    }

    unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment) {
        if block.is_empty() {
            return;
        }
        let record = self.live.borrow_mut().remove(&block.begin());
        match record {
            Some(record) => {
                trace!("deallocate #{} {block:?}", record.id);
                debug_assert_eq!(record.size, block.len(), "{block:?} freed with the wrong size");
                debug_assert_eq!(record.alignment, alignment, "{block:?} freed with the wrong alignment");
            }
            None => debug_assert!(false, "{block:?} is not a live allocation"),
        }
        unsafe { self.inner.deallocate(block, alignment) };
    }
}

impl<A: Owns> Owns for TracingAllocator<A> {
    fn owns(&self, block: ByteSpan) -> bool {
        self.inner.owns(block)
    }
}

impl<A: DeallocateAll> DeallocateAll for TracingAllocator<A> {
    unsafe fn deallocate_all(&self) {
        trace!("deallocate_all(): dropping {} records", self.nr_allocations());
        unsafe { self.inner.deallocate_all() };
        self.live.borrow_mut().clear();
    }
}

/// A [`TracingAllocator`] checkpoint.
///
/// Two checkpoints are equal when their inner states are. The id watermark
/// only decides which records a rewind forgets: ids keep counting up across
/// rewinds, so it differs between otherwise identical states.
#[derive(Clone, Copy, Debug)]
pub struct TracingState<S> {
    inner: S,
    next_id: u64,
}

impl<S: PartialEq> PartialEq for TracingState<S> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<S: Eq> Eq for TracingState<S> {}

impl<A: Rewind> Rewind for TracingAllocator<A> {
    type State = TracingState<A::State>;

    fn save_state(&self) -> Self::State {
        TracingState {
            inner: self.inner.save_state(),
            next_id: self.next_id.get(),
        }
    }

    /// Forgets every record made since `state`. Sequence numbers keep
    /// counting up, so ids are never reused.
    unsafe fn restore_state(&self, state: Self::State) {
        unsafe { self.inner.restore_state(state.inner) };
        self.live
            .borrow_mut()
            .retain(|_, record| record.id < state.next_id);
    }
}

impl<A> fmt::Debug for TracingAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingAllocator")
            .field("live", &self.nr_allocations())
            .field("next_id", &self.next_id.get())
            .finish()
    }
}
