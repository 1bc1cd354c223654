mod config_resolution;
mod pool_lifecycle;
