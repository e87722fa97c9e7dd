pub mod imap;
pub mod parser;
pub mod smtp;
pub mod types;
