// Config command: show the configuration the engine would start with

use anyhow::Result;

use crate::output::{print_field, OutputFormat};
use crate::EngineArgs;

pub fn run(engine_args: &EngineArgs, output: OutputFormat) -> Result<()> {
    let config = engine_args.resolve()?;

    if !output.is_text() {
        return output.print_value(&config);
    }

    let pool = &config.pool;
    let breaker = &config.circuit_breaker;
    print_field("Max workers", &pool.max_workers.to_string());
    print_field("Max queue size", &pool.max_queue_size.to_string());
    print_field(
        "Default timeout",
        &format!("{}ms", pool.default_timeout.as_millis()),
    );
    print_field(
        "Shutdown poll",
        &format!("{}ms", pool.shutdown_poll_interval.as_millis()),
    );
    print_field(
        "Shutdown grace",
        &format!("{}ms", engine_args.shutdown_grace().as_millis()),
    );
    print_field("CB failures", &breaker.failure_threshold.to_string());
    print_field("CB successes", &breaker.success_threshold.to_string());
    print_field(
        "CB reset",
        &format!("{}ms", breaker.reset_timeout.as_millis()),
    );
    print_field("CB window", &format!("{}ms", breaker.window_size.as_millis()));
    Ok(())
}
