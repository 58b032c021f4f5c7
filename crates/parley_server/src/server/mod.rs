#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod invite;
pub mod keepalive;
pub mod listener;
pub mod room_hub;
pub mod state;




#[cfg(test)]
mod test_support;

#[cfg(test)]
mod ws_smoke_tests;
