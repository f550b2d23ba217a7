use chrono::Utc;

use being_config::AppConfig;
use being_memory::{MemoryRecord, MemoryStats, RecordPayload};
use being_runtime::{Scheduler, StatusSnapshot};

pub(crate) fn print_status(config: &AppConfig, status: &StatusSnapshot) {
    println!("{}", config.agent.name);
    println!(
        "- energy: {:.2}  mood: {}",
        status.state.energy, status.state.mood
    );
    match status.state.last_activity_timestamp {
        Some(at) => println!("- last activity: {}", at.to_rfc3339()),
        None => println!("- last activity: never"),
    }
    print_stats(&status.memory);

    if let Some(next) = status.next_available.first() {
        println!(
            "- next available: {} in {:.0}s",
            next.activity, next.available_in_secs
        );
    }

    println!("recent:");
    print_records(&status.recent.iter().collect::<Vec<_>>());
    if !status.pending_chat.is_empty() {
        println!("pending chat:");
        print_records(&status.pending_chat.iter().collect::<Vec<_>>());
    }
}

pub(crate) fn print_stats(stats: &MemoryStats) {
    println!(
        "- memory: total={} short_term={} long_term={} pending_chat={} categories={}",
        stats.total, stats.short_term, stats.long_term, stats.pending_chat, stats.categories
    );
}

pub(crate) async fn print_activities(scheduler: &Scheduler) {
    let now = Utc::now();
    let registry = scheduler.registry().await;
    if registry.is_empty() {
        println!("no activities registered");
        return;
    }
    for next in registry.next_available(now) {
        let Some(descriptor) = registry.get(&next.activity) else {
            continue;
        };
        let availability = if next.available_in_secs <= 0.0 {
            "ready".to_string()
        } else {
            format!("in {:.0}s", next.available_in_secs)
        };
        let caps = if descriptor.required_capabilities.is_empty() {
            "-".to_string()
        } else {
            descriptor
                .required_capabilities
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(",")
        };
        println!(
            "{:<24} cost={:.2} cooldown={:>6.0}s caps={caps} {availability}",
            descriptor.name, descriptor.energy_cost, next.cooldown_secs
        );
    }
}

pub(crate) fn print_records(records: &[&MemoryRecord]) {
    if records.is_empty() {
        println!("  (none)");
        return;
    }
    for record in records {
        println!("  {}", describe(record));
    }
}

fn describe(record: &MemoryRecord) -> String {
    let when = record.timestamp.format("%Y-%m-%d %H:%M:%S");
    match &record.payload {
        RecordPayload::Activity(result) => {
            let outcome = if result.success {
                "ok".to_string()
            } else {
                format!("failed: {}", result.error.as_deref().unwrap_or("unknown error"))
            };
            format!("[{}] {when} {} {outcome}", record.id_short(), record.category)
        }
        RecordPayload::Chat { message, response } => {
            let mut line = format!(
                "[{}] {when} {:?} <{}> {}",
                record.id_short(),
                record.status,
                message.sender,
                message.message
            );
            if let Some(response) = response {
                line.push_str(&format!(" => {}", response.message));
            }
            line
        }
    }
}
