pub mod backups;
pub mod db;
pub mod lock;
