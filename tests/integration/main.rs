//! Integration tests: driver core against simulated MDrive units.

mod connect_tests;
mod mock_bus;
mod motion_tests;
mod program_tests;
