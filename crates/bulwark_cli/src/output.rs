//! Human-readable rendering.

use bulwark_sim::SimReport;
use console::style;
use std::fmt::Write;
use std::path::Path;

/// Render a simulation report as a short table
pub fn render_report(report: &SimReport) -> String {
    let mut out = String::new();
    let rate = report.success_rate() * 100.0;
    let rate = if rate >= 95.0 {
        style(format!("{rate:.1}%")).green()
    } else if rate >= 75.0 {
        style(format!("{rate:.1}%")).yellow()
    } else {
        style(format!("{rate:.1}%")).red()
    };

    let _ = writeln!(
        out,
        "{} seed={} requests={} simulated={}ms",
        style("simulation").bold(),
        report.seed,
        report.requests,
        report.virtual_elapsed_ms
    );
    let _ = writeln!(
        out,
        "  succeeded {}  failed {}  success rate {}",
        report.succeeded, report.failed, rate
    );
    let _ = writeln!(
        out,
        "  backend calls {}  batch calls {} ({} items)  injected {}  outage {}",
        report.backend.calls,
        report.backend.batch_calls,
        report.backend.batch_items,
        report.backend.injected_failures,
        report.backend.outage_failures
    );

    let _ = writeln!(out, "\n{}", style("by priority").bold());
    let _ = writeln!(
        out,
        "  {:<9}{:>7}{:>7}{:>7}{:>7}{:>7}{:>7}{:>7}{:>10}",
        "class", "reqs", "ok", "err", "cache", "dedup", "batch", "stale", "avg ms"
    );
    for (priority, o) in &report.by_priority {
        let _ = writeln!(
            out,
            "  {:<9}{:>7}{:>7}{:>7}{:>7}{:>7}{:>7}{:>7}{:>10.1}",
            priority.as_str(),
            o.requests,
            o.succeeded,
            o.failed,
            o.from_cache,
            o.deduplicated,
            o.batched,
            o.stale,
            o.avg_latency_ms()
        );
    }

    if !report.errors.is_empty() {
        let _ = writeln!(out, "\n{}", style("errors").bold());
        for (kind, count) in &report.errors {
            let _ = writeln!(out, "  {kind:<18}{count:>7}");
        }
    }

    let metrics = &report.metrics;
    let _ = writeln!(
        out,
        "\n{} throttled {:.1}%  cache hit {:.1}%  retries {}  load {:.2}",
        style("coordinator").bold(),
        metrics.throttle.throttle_ratio() * 100.0,
        metrics.cache.hit_rate() * 100.0,
        metrics.requests.retries,
        metrics.load
    );
    for breaker in &metrics.breakers {
        let _ = writeln!(
            out,
            "  breaker {:<12} {:?}",
            breaker.resource, breaker.state
        );
    }
    for rec in &metrics.recommendations {
        let _ = writeln!(out, "  {} {}", style("hint").cyan(), rec.message);
    }
    out
}

/// Confirmation line for a valid config file
pub fn render_valid(path: &Path) -> String {
    format!("{} {}", style("valid").green(), path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_valid_names_file() {
        console::set_colors_enabled(false);
        assert_eq!(render_valid(Path::new("bulwark.json")), "valid bulwark.json");
    }
}
