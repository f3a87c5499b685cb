pub const DEFAULT_CONFIG_FILE_PATH: &str = "/etc/radiusd/radiusd.toml";

pub const DEFAULT_WORKERS: usize = 4;
