mod handle;
mod manager;

pub use manager::AccountManager;
