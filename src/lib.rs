//! Hardware performance counter backend for command stream frontend (CSF) GPUs.
//!
//! Describes the counter layout of a GPU, selects counters, and collects the
//! samples a firmware sampling engine writes into a ring buffer shared with the
//! CPU.
//!
//! ## Example
//!
//! Collect every counter of a simulated GPU with two shader cores.
//!
//! ```rust
//! use gpu_hwcnt::backend::Backend;
//! use gpu_hwcnt::config::Opts;
//! use gpu_hwcnt::csf_if::sim::SimInterface;
//! use gpu_hwcnt::dump::DumpBuffer;
//! use gpu_hwcnt::gpu::GpuInfo;
//! use gpu_hwcnt::map::EnableMap;
//!
//! let info = GpuInfo {
//!     l2_count: 1,
//!     core_mask: 0b101, // Sparse masks are fine.
//!     clk_cnt: 1,
//! };
//! let sim = SimInterface::new(&info).unwrap();
//!
//! let mut backend = Backend::create(sim, Opts::default()).unwrap();
//! backend.metadata_init().unwrap();
//! let metadata = backend.metadata().unwrap();
//!
//! let mut map = EnableMap::new(metadata);
//! map.enable_all();
//! backend.dump_enable(&map).unwrap();
//! backend.on_prfcnt_enable(); // Firmware acknowledged.
//!
//! let dump_time_ns = backend.dump_request().unwrap();
//! backend.on_prfcnt_sample(); // Firmware wrote the sample.
//! tokio_test::block_on(backend.dump_wait()).unwrap();
//!
//! let mut dump = DumpBuffer::new(metadata);
//! backend.dump_get(&mut dump, &map, false).unwrap();
//! for block in metadata.blocks() {
//!     let values = &dump.values()[block.values()];
//!     println!("{:?} #{} at {}ns: {:?}", block.ty, block.inst, dump_time_ns, values);
//! }
//! ```
//!
//! ## Counter layout
//!
//! Only the V5 layout is supported: front-end, tiler, one block per shader
//! core and one per L2 slice, 4 headers and 60 counters each.

pub mod backend;
pub mod config;
pub mod csf_if;
pub mod dump;
pub mod error;
pub mod gpu;
pub mod map;
pub mod metadata;
pub mod ring;
