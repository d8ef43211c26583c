use crossterm::style::{StyledContent, Stylize};
use std::{collections::BTreeMap, io::Write};
use tabled::settings::object::{Cell, Columns, FirstColumn, LastColumn, Rows};
use tabled::settings::Padding;
use tabled::{
    builder::Builder,
    settings::{themes::Colorization, Alignment, Color, Margin, Style},
};

use crate::{
    duration::{Latency, LatencyUnit},
    report::LoadReport,
    snapshot::LatencySummary,
};

/// Prints the report as aligned, colored text.
pub struct TextReporter;

impl super::LoadReporter for TextReporter {
    fn print(&self, w: &mut dyn Write, report: &LoadReport) -> anyhow::Result<()> {
        print_summary(w, report)?;
        writeln!(w)?;

        if !report.result.status_codes.is_empty() {
            print_status_codes(w, &report.result.status_codes)?;
            writeln!(w)?;
        }

        if let Some(latency) = &report.result.latency {
            print_latency(w, latency)?;
            writeln!(w)?;
        }

        Ok(())
    }
}

fn render_success_ratio(success: u64, total: u64) -> StyledContent<String> {
    if total == 0 {
        return "n/a".to_string().dark_grey();
    }
    let ratio = 100.0 * success as f64 / total as f64;
    let text = format!("{:.2}%", ratio);
    if ratio >= 100.0 {
        text.green().bold()
    } else if ratio >= 99.0 {
        text.yellow().bold()
    } else {
        text.red().bold()
    }
}

fn print_summary(w: &mut dyn Write, report: &LoadReport) -> anyhow::Result<()> {
    let r = &report.result;

    writeln!(w, "{}", "Summary".h1())?;
    writeln!(w, "  Success ratio: {}", render_success_ratio(r.total_success, r.total_requests))?;
    writeln!(w)?;

    let mut rows: Vec<[String; 2]> = vec![
        ["VUs".into(), report.vus.to_string()],
        ["Duration".into(), humantime::format_duration(report.duration).to_string()],
        ["Elapsed".into(), format!("{:.2}s", r.elapsed.as_secs_f64())],
        ["Iterations".into(), report.stats.iterations.to_string()],
        ["Total requests".into(), r.total_requests.to_string()],
        ["Total success".into(), r.total_success.to_string()],
        ["Total failed".into(), r.total_failed.to_string()],
    ];
    rows.extend(r.failure_reasons.iter().map(|(reason, count)| [format!("  {reason}"), count.to_string()]));
    let reasons = r.failure_reasons.len();
    if r.total_unclassified > 0 {
        rows.push(["Unclassified".into(), r.total_unclassified.to_string()]);
    }
    if report.stats.hook_errors > 0 {
        rows.push(["Hook errors".into(), report.stats.hook_errors.to_string()]);
    }
    rows.extend([
        ["Total request time".into(), format!("{}ms", r.total_request_time_ms)],
        ["Average latency".into(), format!("{}ms", r.average_latency_ms)],
        ["Requests/sec".into(), format!("{:.2}", r.rps)],
        ["  success".into(), format!("{:.2}", r.success_rps)],
        ["  failed".into(), format!("{:.2}", r.failed_rps)],
    ]);

    let mut table = Builder::from_iter(rows).build();
    table
        .with(Style::empty())
        .with(Margin::new(2, 0, 0, 0))
        .with(Padding::new(0, 2, 0, 0))
        .with(Alignment::left())
        .with(Colorization::exact([Color::FG_GREEN], LastColumn))
        .modify(LastColumn, Alignment::right());
    if reasons > 0 {
        // failure reason rows follow "Total failed" (row 6)
        table.with(Colorization::exact([Color::FG_RED], Rows::new(7..7 + reasons)));
    }

    writeln!(w, "{}", table)?;
    Ok(())
}

fn print_status_codes(w: &mut dyn Write, codes: &BTreeMap<u16, u64>) -> anyhow::Result<()> {
    writeln!(w, "{}", "Status codes".h1())?;
    let max = codes.values().max().copied().unwrap_or_default();
    let count_width = max.to_string().len();
    for (&code, count) in codes {
        let count = format!("{count:>count_width$}").green();
        let status = format!("HTTP {code}");
        let status = match code / 100 {
            2 => status.green(),
            4 => status.yellow(),
            _ => status.red(),
        };
        writeln!(w, "  [{count}] {status}")?;
    }
    Ok(())
}

fn print_latency(w: &mut dyn Write, latency: &LatencySummary) -> anyhow::Result<()> {
    writeln!(w, "{}", "Latencies".h1())?;

    let median = latency.percentiles.first().map(|&(_, d)| d).unwrap_or(latency.max);
    let u = LatencyUnit::of(median);

    let stats = vec![
        vec!["Min".to_string(), "Max".to_string()],
        vec![
            format!("{:.2}", Latency::new(latency.min, u)),
            format!("{:.2}", Latency::new(latency.max, u)),
        ],
    ];
    let mut stats = Builder::from(stats).build();
    stats
        .with(Style::empty())
        .with(Margin::new(1, 0, 0, 0))
        .with(Alignment::center())
        .with(Colorization::exact([Color::FG_GREEN], Rows::new(1..=1)))
        .with(Colorization::exact([Color::FG_CYAN], Cell::new(0, 0)))
        .with(Colorization::exact([Color::FG_RED], Cell::new(0, 1)));
    writeln!(w, "{}", stats)?;
    writeln!(w)?;

    writeln!(w, "{}", "  Percentiles".h2())?;
    let percentiles = latency
        .percentiles
        .iter()
        .map(|&(p, v)| vec![format!("{:.2}%", p), " in ".to_string(), format!("{:.2}", Latency::new(v, u))]);
    let mut percentiles = Builder::from_iter(percentiles).build();
    percentiles
        .with(Style::empty())
        .with(Margin::new(3, 0, 0, 0))
        .with(Alignment::center())
        .with(Padding::zero())
        .with(Colorization::exact([Color::FG_GREEN], FirstColumn))
        .with(Colorization::exact([Color::FG_GREEN], LastColumn))
        .modify(Columns::new(2..=2), Alignment::right());
    writeln!(w, "{}", percentiles)?;
    Ok(())
}

trait ReportStyle {
    fn h1(&self) -> StyledContent<&str>;
    fn h2(&self) -> StyledContent<&str>;
}

impl<T: AsRef<str>> ReportStyle for T {
    fn h1(&self) -> StyledContent<&str> {
        self.as_ref().bold().underlined().yellow()
    }

    fn h2(&self) -> StyledContent<&str> {
        self.as_ref().bold().cyan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{fixtures, LoadReporter};

    fn render() -> String {
        let mut out = Vec::new();
        TextReporter.print(&mut out, &fixtures::report()).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn lines_follow_the_fixed_order() {
        let out = render();
        let labels = [
            "VUs",
            "Duration",
            "Iterations",
            "Total requests",
            "Total success",
            "Total failed",
            "status 500",
            "timeout",
            "Unclassified",
            "Total request time",
            "Average latency",
            "Requests/sec",
            "Status codes",
            "HTTP 200",
            "HTTP 500",
            "Latencies",
            "Percentiles",
        ];
        let positions = labels
            .iter()
            .map(|label| out.find(label).unwrap_or_else(|| panic!("missing {label} in:\n{out}")))
            .collect::<Vec<_>>();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{out}");
    }

    #[test]
    fn prints_values() {
        let out = render();
        assert!(out.contains("210ms"), "{out}");
        assert!(out.contains("35ms"), "{out}");
        assert!(out.contains("3.00"), "{out}");
        assert!(out.contains("2s"), "{out}");
    }

    #[test]
    fn prints_status_code_counts() {
        let out = render();
        let line = |status: &str| out.lines().find(|l| l.contains(status)).unwrap_or_else(|| panic!("{out}"));
        assert!(line("HTTP 200").contains('4'));
        assert!(line("HTTP 500").contains('1'));
    }

    #[test]
    fn no_latency_section_without_requests() {
        let mut report = fixtures::report();
        report.result.latency = None;
        report.result.total_unclassified = 0;
        report.result.status_codes.clear();

        let mut out = Vec::new();
        TextReporter.print(&mut out, &report).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(!out.contains("Latencies"));
        assert!(!out.contains("Unclassified"));
        assert!(!out.contains("Status codes"));
    }
}
