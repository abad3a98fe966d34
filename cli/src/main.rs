use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use sqlprobe_core::core::admission::admit;
use sqlprobe_core::core::compare::format_number;
use sqlprobe_core::core::engine::request_signature;
use sqlprobe_core::core::mutator::extract_parameters;
use sqlprobe_core::core::pool::PoolSizing;
use sqlprobe_core::http::Exchange;
use sqlprobe_core::{
    read_lines, ConsoleSink, DetectionConfig, EngineConfig, FilterConfig,
    HttpClient, HttpRequest, Metric, PayloadLoader, ScanPipeline, Submission,
};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "sqlprobe",
    version,
    about = "Differential SQL-injection scanner",
    override_usage = "sqlprobe <target>  <options>",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Quick scan:                     sqlprobe \"http://target.com/item?id=5\"
  Verbose mode:                   sqlprobe \"http://target.com/item?id=5\" -v
  With proxy (Burp):              sqlprobe \"http://target.com/item?id=5\" --proxy http://127.0.0.1:8080
  Custom headers:                 sqlprobe \"http://target.com/item?id=5\" -H \"Cookie: sess=abc\"
  Scan from file:                 sqlprobe -l urls.txt --whitelist target.com
  Custom payloads:                sqlprobe -l urls.txt -p diy.txt --diy-delay-ms 4000
  Dry-run test:                   sqlprobe \"http://target.com/item?id=5\" --dry-run"
)]
pub struct Args {
    #[arg(required_unless_present = "list")]
    pub target: Option<String>,

    #[arg(short = 'l', long = "list", help = "File containing target URLs (one per line)")]
    pub list: Option<String>,

    #[arg(long, default_value_t = 10, help = "Request timeout in seconds")]
    pub timeout: u64,

    #[arg(long, help = "Proxy URL (e.g. http://127.0.0.1:8080)")]
    pub proxy: Option<String>,

    #[arg(short = 'H', long = "header", help = "Custom header (e.g. \"Authorization: Bearer TOKEN\")")]
    pub headers: Vec<String>,

    #[arg(long, value_delimiter = ',', help = "Only scan these domains (and their subdomains)")]
    pub whitelist: Vec<String>,

    #[arg(long, value_delimiter = ',', help = "Never scan these domains (and their subdomains)")]
    pub blacklist: Vec<String>,

    #[arg(long = "skip-path", help = "Exact path to skip (repeatable)")]
    pub skip_paths: Vec<String>,

    #[arg(long = "skip-param", value_delimiter = ',', help = "Parameter names that never count as useful")]
    pub skip_params: Vec<String>,

    #[arg(long = "ext", value_delimiter = ',', help = "Replace the list of skipped file extensions")]
    pub extensions: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',',
        value_parser = ["error", "string", "numeric", "order", "boolean", "diy"],
        help = "Strategies to turn off")]
    pub disable: Vec<String>,

    #[arg(long, default_value = "levenshtein",
        value_parser = clap::builder::PossibleValuesParser::new(["levenshtein", "jaccard"]),
        help = "Similarity metric")]
    pub metric: String,

    #[arg(long, default_value_t = 0.9, help = "Similarity at or above which two pages count as the same")]
    pub threshold: f64,

    #[arg(short = 'p', long, help = "File of custom (DIY) payloads, one per line; {value} embeds the original value")]
    pub payloads: Option<String>,

    #[arg(long, help = "File of regexes that flag a DIY payload when the response matches")]
    pub patterns: Option<String>,

    #[arg(long, default_value_t = 0, help = "Flag DIY payloads answering this much slower than the baseline (ms, 0 = off)")]
    pub diy_delay_ms: u64,

    #[arg(long, default_value_t = 0, help = "Fixed pause before each mutated request (ms)")]
    pub delay_ms: u64,

    #[arg(short = 't', long, help = "Hardware concurrency used to size the worker pools")]
    pub threads: Option<usize>,

    #[arg(long, help = "Submit targets manually: rescan known families and apply the size cap")]
    pub manual: bool,

    #[arg(short = 'v', long, default_value_t = false, help = "Show the whole process (Verbose Mode)")]
    pub verbose: bool,

    #[arg(long, help = "Show admission verdicts and signatures without sending requests")]
    pub dry_run: bool,
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    if let Err(e) = run(args).await {
        eprint!("{}\r\n", format!("[!] {:#}", e).red());
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let targets = collect_targets(&args)?;
    if targets.is_empty() {
        eprint!("{}\r\n", "[!] No targets specified. Provide a URL or use -l <file>.".red());
        let mut cmd = Args::command();
        cmd.print_help().ok();
        process::exit(1);
    }

    let config = build_config(&args)?;

    if args.dry_run {
        for target in &targets {
            dry_run(target, &config.filter);
        }
        return Ok(());
    }

    print_banner();
    print_scan_config(&targets, &args, &config);

    let client = HttpClient::new(config.timeout, config.proxy_ref(), &config.parsed_headers())
        .context("building HTTP client")?;
    let pipeline = ScanPipeline::new(&config, Arc::new(client), Some(ConsoleSink::new_ref()));

    let mut submitted = 0usize;
    for target in &targets {
        let request = match parse_target(target) {
            Ok(request) => request,
            Err(e) => {
                eprint!("{}\r\n", format!("[!] Skipping {}: {:#}", target, e).red());
                continue;
            }
        };
        let outcome = if args.manual {
            pipeline.submit_manual(request).await
        } else {
            pipeline.on_exchange(Exchange::new(request, None)).await
        };
        match outcome {
            Submission::Accepted(task) => {
                submitted += 1;
                if args.verbose {
                    print!("{}\r\n", format!("[*] #{} {}", task.id, task.signature).dimmed());
                }
            }
            Submission::Rejected(reason) => {
                print!("{}\r\n", format!("[-] {} skipped: {}", target, reason).yellow());
            }
            Submission::Duplicate(signature) => {
                print!("{}\r\n", format!("[-] {} already covered by {}", target, signature).dimmed());
            }
        }
    }
    std::io::stdout().flush().ok();

    if submitted > 0 {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(120));
        let watcher = {
            let pipeline = pipeline.clone();
            let spinner = spinner.clone();
            tokio::spawn(async move {
                loop {
                    let stats = pipeline.stats();
                    spinner.set_message(format!(
                        "scanning: {}/{} request(s) done, {} vulnerable",
                        stats.processed, submitted, stats.vulnerable
                    ));
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            })
        };

        tokio::select! {
            _ = pipeline.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => {
                spinner.println("[!] Interrupted, stopping scans...");
                pipeline.stop_all();
                pipeline.wait_idle().await;
            }
        }
        watcher.abort();
        spinner.finish_and_clear();
    }

    print_summary(&pipeline);
    Ok(())
}

fn collect_targets(args: &Args) -> Result<Vec<String>> {
    let mut targets: Vec<String> = Vec::new();

    if let Some(ref list_path) = args.list {
        let lines = read_lines(list_path)
            .with_context(|| format!("Failed to read '{}'", list_path))?;
        if !args.dry_run {
            print!(
                "{}\r\n",
                format!("[+] Loaded {} target(s) from {}", lines.len(), list_path)
                    .green().bold()
            );
        }
        targets.extend(lines);
    }

    if let Some(ref t) = args.target {
        targets.push(t.clone());
    }
    Ok(targets)
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    if !(args.threshold > 0.0 && args.threshold <= 1.0) {
        bail!("--threshold must be in (0, 1], got {}", args.threshold);
    }

    let mut filter = FilterConfig {
        whitelist_domains: args.whitelist.clone(),
        blacklist_domains: args.blacklist.clone(),
        blacklist_paths: args.skip_paths.clone(),
        blacklist_params: args.skip_params.clone(),
        ..FilterConfig::default()
    };
    if let Some(ref extensions) = args.extensions {
        filter.illegal_extensions = extensions.clone();
    }

    let loader = PayloadLoader::load_from_paths(args.payloads.as_deref(), args.patterns.as_deref())?;
    let disabled = |name: &str| args.disable.iter().any(|d| d == name);
    let detection = DetectionConfig {
        error_enabled: !disabled("error"),
        string_enabled: !disabled("string"),
        numeric_enabled: !disabled("numeric"),
        order_enabled: !disabled("order"),
        boolean_enabled: !disabled("boolean"),
        diy_enabled: !disabled("diy"),
        metric: if args.metric == "jaccard" { Metric::Jaccard } else { Metric::Levenshtein },
        similarity_threshold: args.threshold,
        diy_payloads: loader.payloads,
        diy_patterns: loader.patterns,
        diy_delay_threshold_ms: args.diy_delay_ms,
        request_delay_ms: args.delay_ms,
        attempt_timeout_ms: args.timeout.max(1) * 1000,
        ..DetectionConfig::default()
    };

    Ok(EngineConfig {
        filter,
        detection,
        timeout: args.timeout,
        proxy: args.proxy.clone().unwrap_or_default(),
        headers: args.headers.join(";"),
        parallelism: args.threads.unwrap_or(0),
        ..EngineConfig::default()
    })
}

fn parse_target(target: &str) -> Result<HttpRequest> {
    let url = Url::parse(target).with_context(|| format!("invalid URL '{}'", target))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("unsupported scheme '{}'", url.scheme());
    }
    Ok(HttpRequest::get(url))
}

/// Prints what the pipeline would do with a target, without sending anything.
fn dry_run(target: &str, filter: &FilterConfig) {
    let request = match parse_target(target) {
        Ok(request) => request,
        Err(e) => {
            println!("[DRY RUN] {} -> invalid: {:#}", target, e);
            return;
        }
    };
    let filter = filter.clone().normalized();
    match admit(&filter, &request) {
        Ok(()) => {
            let params = extract_parameters(&request);
            println!(
                "[DRY RUN] {} -> admitted | signature: {} | parameters: {}",
                target,
                request_signature(&request, &params),
                params.len()
            );
        }
        Err(reason) => println!("[DRY RUN] {} -> rejected: {}", target, reason),
    }
}

fn print_banner() {
    print!("{}\r\n", "sqlprobe :: differential SQL-injection scanner".bright_cyan().bold());
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn print_scan_config(targets: &[String], args: &Args, config: &EngineConfig) {
    let verbose_label = if args.verbose { "ON" } else { "OFF" };
    let parallelism = config.effective_parallelism();
    let (receive, scan) = (PoolSizing::receive(parallelism), PoolSizing::scan(parallelism));

    print!("{}\r\n", format!("[+] Targets:    {}", targets.len()).green().bold());
    print!("{}\r\n", format!("[+] Timeout:    {}s", args.timeout).blue());
    print!(
        "{}\r\n",
        format!(
            "[+] Workers:    receive {}-{}, scan {}-{}",
            receive.core_workers, receive.max_workers, scan.core_workers, scan.max_workers
        )
        .blue()
    );
    print!("{}\r\n", format!("[+] Metric:     {} (threshold {})", args.metric, args.threshold).magenta().bold());
    print!("{}\r\n", format!("[+] Verbose:    {}", verbose_label).magenta());
    if !config.detection.diy_payloads.is_empty() {
        print!(
            "{}\r\n",
            format!("[+] DIY:        {} payload(s)", config.detection.diy_payloads.len()).yellow()
        );
    }
    if let Some(ref proxy) = args.proxy {
        print!("{}\r\n", format!("[+] Proxy:      {}", proxy).yellow());
    }
    if !args.headers.is_empty() {
        print!("{}\r\n", format!("[+] Headers:    {} custom", args.headers.len()).yellow());
    }
    if !args.disable.is_empty() {
        print!("{}\r\n", format!("[+] Disabled:   {}", args.disable.join(", ")).yellow());
    }
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn print_summary(pipeline: &ScanPipeline) {
    let stats = pipeline.stats();
    let index = pipeline.index();

    print!("\r\n{}\r\n", "━━━ Summary ━━━".bright_white().bold());
    print!("{}\r\n", format!("[+] Scanned:     {}", format_number(stats.processed)).green());
    print!("{}\r\n", format!("[+] Skipped:     {}", format_number(stats.rejected)).dimmed());
    if stats.errors > 0 {
        print!("{}\r\n", format!("[!] Errors:      {}", format_number(stats.errors)).red());
    }
    if stats.stopped > 0 {
        print!("{}\r\n", format!("[!] Stopped:     {}", format_number(stats.stopped)).yellow());
    }

    if index.is_empty() {
        print!("{}\r\n", "[+] No SQL injection found.".green().bold());
    } else {
        print!(
            "{}\r\n",
            format!(
                "[+] Vulnerable:  {} request famil{} ({} finding(s))",
                stats.vulnerable,
                if stats.vulnerable == 1 { "y" } else { "ies" },
                index.total_findings()
            )
            .red()
            .bold()
        );
        for signature in index.signatures() {
            let findings = index.get(&signature);
            let mut tags: Vec<String> = findings
                .iter()
                .map(|f| format!("{}:{}", f.parameter, f.strategy.marker().trim_start_matches('-')))
                .collect();
            tags.sort();
            tags.dedup();
            print!("    {} {}\r\n", signature.white(), tags.join(" ").yellow());
        }
    }
    std::io::stdout().flush().ok();
}
