use serde_derive::Deserialize;
use serde_derive::Serialize;

use log::{error, warn};
use std::fs;

use crate::{
    exception::Exception,
    param::{DEFAULT_MAX_AGE, MAX_AGE_LIMIT},
};

/// 一个挂载点的配置：URL 前缀与对应目录
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MountConfig {
    pub prefix: String,
    pub dir: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    port: u16,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_local")]
    local: bool,
    #[serde(default = "default_max_age")]
    max_age: u64,
    #[serde(default = "default_true")]
    enable_range_requests: bool,
    #[serde(default = "default_true")]
    enable_compression: bool,
    #[serde(default)]
    mounts: Vec<MountConfig>,
}

fn default_local() -> bool {
    true
}

fn default_max_age() -> u64 {
    DEFAULT_MAX_AGE
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn new() -> Self {
        Self {
            port: 7878,
            worker_threads: num_cpus::get(),
            local: default_local(),
            max_age: default_max_age(),
            enable_range_requests: true,
            enable_compression: true,
            mounts: vec![MountConfig {
                prefix: "/static".to_string(),
                dir: "static".to_string(),
            }],
        }
    }

    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let str_val = match fs::read_to_string(filename) {
            Ok(s) => s,
            Err(e) => {
                error!("无法读取配置文件{}：{}", filename, e);
                return Err(Exception::InvalidConfig);
            }
        };
        Self::from_toml_str(&str_val)
    }

    pub fn from_toml_str(str_val: &str) -> Result<Self, Exception> {
        let mut raw_config: Config = match toml::from_str(str_val) {
            Ok(t) => t,
            Err(e) => {
                error!("无法成功从配置文件构建配置对象：{}", e);
                return Err(Exception::InvalidConfig);
            }
        };
        if raw_config.worker_threads == 0 {
            raw_config.worker_threads = num_cpus::get();
        }
        if raw_config.max_age > MAX_AGE_LIMIT {
            warn!(
                "max_age={}超出上限，截断为{}",
                raw_config.max_age, MAX_AGE_LIMIT
            );
            raw_config.max_age = MAX_AGE_LIMIT;
        }
        if raw_config.mounts.is_empty() {
            warn!("配置中没有任何挂载点，服务器将对所有请求返回404");
        }
        Ok(raw_config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    pub fn enable_range_requests(&self) -> bool {
        self.enable_range_requests
    }

    pub fn enable_compression(&self) -> bool {
        self.enable_compression
    }

    pub fn mounts(&self) -> &[MountConfig] {
        &self.mounts
    }
}
