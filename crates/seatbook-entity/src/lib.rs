//! # seatbook-entity
//!
//! Row models for the booking store: passengers, trips and seats.

pub mod passenger;
pub mod seat;
pub mod trip;

pub use passenger::Passenger;
pub use seat::Seat;
pub use trip::Trip;
