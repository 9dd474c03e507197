//! Validate command implementation.

use ingestd_core::Config;

/// Print a summary of an already validated configuration.
pub fn run(config: &Config) {
    println!("Configuration is valid");
    println!("  repo:    {}", config.butler.repo);
    println!("  catalog: {:?}", config.butler.catalog_type);
    println!("  brokers: {}", config.kafka.brokers.join(","));
    println!("  group:   {}", config.kafka.group_id);
    println!("  topics:");
    for (topic, mapping) in &config.topics {
        println!(
            "    {} ({} -> {})",
            topic, mapping.rucio_prefix, mapping.fs_prefix
        );
    }
}
