//! Default value functions for serde.

pub fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

pub fn default_basedir() -> String {
    "data".to_string()
}

pub fn default_invite_award_days() -> i64 {
    180
}

pub fn default_redis_host() -> String {
    "localhost".to_string()
}

pub fn default_redis_port() -> u16 {
    6379
}
