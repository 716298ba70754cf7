pub mod challenge;
pub mod health;
pub mod security;
