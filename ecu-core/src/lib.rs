#![no_std]

// Engine control core shared by the firmware and host tooling.
//
// Everything here is allocation-free and independent of any executor so the
// interrupt path, the Embassy tasks and the host emulator all run the same
// decoder, scheduler, planner and safety logic.

pub mod angle;
pub mod calibration;
pub mod closed_loop;
pub mod decoder;
pub mod drivers;
pub mod engine;
pub mod fuel;
pub mod monitor;
pub mod pipeline;
pub mod safety;
pub mod scheduler;
pub mod sensors;
pub mod sync;
pub mod tables;
pub mod telemetry;
pub mod timing;

/// Number of cylinders driven by the controller.
pub const CYLINDER_COUNT: usize = 4;
