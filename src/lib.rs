//! VRCore is the onboard controller core of a head-mounted eye tracker.
//!
//! Two `eye-worker` processes, one per eye, track the pupil in camera frames
//! that an external provider writes into named shared memory. The host side
//! supervises those workers, pairs their per-eye results by frame id, and
//! talks to the client application over a prioritized message router.
//!
//! The pieces, roughly in data-flow order:
//!
//! * [`supervisor`] and [`process`] start, watch and stop the workers.
//! * [`sync`] pairs left and right results.
//! * [`image_packet`] packs preview images for the wire.
//! * [`router`] and [`routing`] move messages to and from the client.
//! * [`tracker_control`] switches operating modes.
//! * [`tracker_core`] wires all of the above together.

pub mod args;
pub mod config;
pub mod error;
pub mod image_packet;
pub mod message;
pub mod process;
pub mod router;
pub mod routing;
pub mod service;
pub mod shm;
pub mod signal;
pub mod supervisor;
pub mod sync;
pub mod tracker_control;
pub mod tracker_core;
pub mod worker;
pub mod worker_message;
