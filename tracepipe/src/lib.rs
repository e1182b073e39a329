//! # tracepipe - Cross-Thread Event Ingestion Pipeline
//!
//! tracepipe captures timestamped events from many threads (application
//! zones, messages, plot samples and kernel scheduling transitions) and hands
//! them, in per-thread publication order, to a single drain thread that
//! writes them out as one stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────────────────────┐
//! │  Application Threads │   │        System Trace Collector        │
//! │  instrument::zone()  │   │  ETW kernel logger  │  ftrace pipe   │
//! │  message() / plot()  │   │  CSwitch/ReadyThread│  sched_switch  │
//! └──────────┬───────────┘   └──────────────────┬───────────────────┘
//!            │ token: reserve / commit          │ worker thread token
//!            ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Publish Queue (one SPSC ring per producer)             │
//! │          tail index published with release stores               │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │ acquire loads, per-producer order
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Drain Thread ──▶ ThreadContext markers ──▶ stream writer       │
//! │       │                                                        │
//! │       └──▶ Name Resolver (first sight of a thread id)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`queue`]: lock-free multi-producer / single-consumer publish queue
//! - [`instrument`]: zone, message and plot call sites on the global queue
//! - [`systrace`]: `Start` / `Worker` / `Stop` collectors
//!   - `etw`: Windows kernel logger, binary records
//!   - `ftrace`: Linux `trace_pipe`, text lines
//! - [`resolver`]: thread id to thread and process names
//! - [`drain`]: the single consumer and the stream writer
//! - [`recorder`]: session wiring used by `tracepipe record`
//! - [`dump`]: stream decoding used by `tracepipe dump`
//! - [`clock`]: the tick source every record is stamped with
//! - [`domain`]: newtypes (`Pid`, `Tid`, `CpuId`) and error enums
//! - [`cli`], [`preflight`]: binary front end
//!
//! Record shapes and the wire format live in `tracepipe-common`.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Record scheduling events for 10 seconds
//! sudo tracepipe record --duration 10 --output run.tpip
//!
//! # Inspect the stream
//! tracepipe dump run.tpip --json
//! ```
//!
//! ## Key Concepts
//!
//! - **Token**: a producer thread's private handle to its ring
//! - **Tail index**: count of published records; the consumer never reads past it
//! - **State codes**: OS-neutral thread states, 100 (unknown) to 109 (zombie)
//! - **Connected**: collectors skip OS events while no viewer wants them

pub mod cli;
pub mod clock;
pub mod domain;
pub mod drain;
pub mod dump;
pub mod instrument;
pub mod preflight;
pub mod queue;
pub mod recorder;
pub mod resolver;
pub mod systrace;
