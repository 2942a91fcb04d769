//! Data models shared by the API client, login protocols and sessions.

pub mod cookies;
pub mod passenger;
pub mod profile;

pub use cookies::CookieJar;
pub use passenger::{Passenger, PassengerListing, PassengerRecord, PassengerType};
pub use profile::Profile;
