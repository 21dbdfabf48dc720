use std::env;
use std::process::ExitCode;

use mu_epub_lint::metadata::PackageMetadata;
use mu_epub_lint::{
    validate_epub_file_with_options, Diagnostic, Platform, PlatformSet, Report, ValidationOptions,
};

#[derive(Clone, Debug)]
enum Json {
    Null,
    Bool(bool),
    Num(usize),
    Str(String),
    Arr(Vec<Json>),
    Obj(Vec<(String, Json)>),
}

impl Json {
    fn render(&self, pretty: bool) -> String {
        let mut out = String::new();
        self.write_into(&mut out, pretty, 0);
        out
    }

    fn write_into(&self, out: &mut String, pretty: bool, depth: usize) {
        match self {
            Json::Null => out.push_str("null"),
            Json::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
            Json::Num(v) => out.push_str(&v.to_string()),
            Json::Str(v) => write_json_string(out, v),
            Json::Arr(items) => {
                out.push('[');
                for (idx, item) in items.iter().enumerate() {
                    open_member(out, pretty, depth);
                    item.write_into(out, pretty, depth + 1);
                    if idx + 1 != items.len() {
                        out.push(',');
                    }
                }
                close_container(out, pretty, depth, items.is_empty());
                out.push(']');
            }
            Json::Obj(fields) => {
                out.push('{');
                for (idx, (key, value)) in fields.iter().enumerate() {
                    open_member(out, pretty, depth);
                    write_json_string(out, key);
                    out.push(':');
                    if pretty {
                        out.push(' ');
                    }
                    value.write_into(out, pretty, depth + 1);
                    if idx + 1 != fields.len() {
                        out.push(',');
                    }
                }
                close_container(out, pretty, depth, fields.is_empty());
                out.push('}');
            }
        }
    }
}

fn open_member(out: &mut String, pretty: bool, depth: usize) {
    if pretty {
        out.push('\n');
        write_indent(out, depth + 1);
    }
}

fn close_container(out: &mut String, pretty: bool, depth: usize, empty: bool) {
    if pretty && !empty {
        out.push('\n');
        write_indent(out, depth);
    }
}

fn write_indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_json_string(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c <= '\u{1f}' => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn opt_str(value: Option<&str>) -> Json {
    value.map_or(Json::Null, |v| Json::Str(v.to_string()))
}

struct Args {
    json: bool,
    pretty: bool,
    options: ValidationOptions,
    path: String,
}

fn main() -> ExitCode {
    let args = match parse_args(env::args().skip(1).collect()) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print_help();
            return ExitCode::SUCCESS;
        }
        Err(msg) => {
            eprintln!("error: {}", msg);
            eprintln!("run `mu-epub-lint --help` for usage");
            return ExitCode::from(2);
        }
    };

    let report = validate_epub_file_with_options(&args.path, args.options);
    if args.json {
        println!("{}", report_json(&args.path, &report).render(args.pretty));
    } else {
        print!("{}", report_text(&args.path, &report));
    }
    ExitCode::from(report.exit_status().code())
}

fn parse_args(mut rest: Vec<String>) -> Result<Option<Args>, String> {
    if rest.is_empty() || pop_flag(&mut rest, "--help") || pop_flag(&mut rest, "-h") {
        return Ok(None);
    }
    let json = pop_flag(&mut rest, "--json");
    let pretty = pop_flag(&mut rest, "--pretty");

    let mut options = ValidationOptions::default();
    if let Some(raw) = pop_value(&mut rest, "--max-ratio")? {
        let ratio = parse_number(&raw, "--max-ratio")?;
        if ratio == 0 {
            return Err("--max-ratio must be at least 1".to_string());
        }
        options = options.with_max_ratio(ratio);
    }
    if let Some(raw) = pop_value(&mut rest, "--max-entry-size")? {
        options = options.with_max_entry_size(parse_number(&raw, "--max-entry-size")?);
    }

    let mut platforms: Option<PlatformSet> = None;
    while let Some(tag) = pop_value(&mut rest, "--platform")? {
        let platform = Platform::from_tag(&tag).ok_or_else(|| {
            let known: Vec<&str> = Platform::ALL.iter().map(|p| p.tag()).collect();
            format!("unknown platform '{}' (expected one of: {})", tag, known.join(", "))
        })?;
        platforms = Some(platforms.unwrap_or_else(PlatformSet::none).with(platform));
    }
    if let Some(platforms) = platforms {
        options = options.with_platforms(platforms);
    }

    if let Some(unknown) = rest.iter().find(|a| a.starts_with("--")) {
        return Err(format!("unknown option '{}'", unknown));
    }
    match rest.len() {
        0 => Err("missing <epub_path>".to_string()),
        1 => Ok(Some(Args {
            json,
            pretty,
            options,
            path: rest.remove(0),
        })),
        _ => Err("expected exactly one <epub_path>".to_string()),
    }
}

fn pop_flag(args: &mut Vec<String>, flag: &str) -> bool {
    if let Some(pos) = args.iter().position(|a| a == flag) {
        args.remove(pos);
        true
    } else {
        false
    }
}

fn pop_value(args: &mut Vec<String>, flag: &str) -> Result<Option<String>, String> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        return Err(format!("{} requires a value", flag));
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn parse_number(raw: &str, flag: &str) -> Result<u64, String> {
    raw.parse::<u64>()
        .map_err(|_| format!("{} expects a non-negative integer, got '{}'", flag, raw))
}

fn report_json(path: &str, report: &Report) -> Json {
    let counts = report.counts();
    let buckets = report
        .buckets()
        .into_iter()
        .map(|(platform, severity, diagnostics)| {
            Json::Obj(vec![
                ("platform".to_string(), Json::Str(platform.tag().to_string())),
                ("severity".to_string(), Json::Str(severity.label().to_string())),
                ("count".to_string(), Json::Num(diagnostics.len())),
                (
                    "diagnostics".to_string(),
                    Json::Arr(diagnostics.into_iter().map(diagnostic_json).collect()),
                ),
            ])
        })
        .collect();
    let critical = report
        .critical_view()
        .iter()
        .map(|group| {
            let issues = group
                .issues
                .iter()
                .map(|issue| {
                    Json::Obj(vec![
                        ("code".to_string(), Json::Str(issue.code.to_string())),
                        (
                            "consequence".to_string(),
                            Json::Str(issue.consequence.to_string()),
                        ),
                        ("count".to_string(), Json::Num(issue.count)),
                        ("first".to_string(), diagnostic_json(&issue.first)),
                    ])
                })
                .collect();
            Json::Obj(vec![
                (
                    "platform".to_string(),
                    Json::Str(group.platform.tag().to_string()),
                ),
                ("issues".to_string(), Json::Arr(issues)),
            ])
        })
        .collect();

    Json::Obj(vec![
        ("epub".to_string(), Json::Str(path.to_string())),
        ("exit_status".to_string(), Json::Num(report.exit_status().code() as usize)),
        ("passed".to_string(), Json::Bool(!report.has_failures())),
        (
            "counts".to_string(),
            Json::Obj(vec![
                ("issues".to_string(), Json::Num(counts.issues)),
                ("warnings".to_string(), Json::Num(counts.warnings)),
                ("info".to_string(), Json::Num(counts.info)),
                ("critical".to_string(), Json::Num(counts.critical)),
            ]),
        ),
        (
            "metadata".to_string(),
            report.metadata().map_or(Json::Null, metadata_json),
        ),
        ("critical".to_string(), Json::Arr(critical)),
        ("buckets".to_string(), Json::Arr(buckets)),
    ])
}

fn metadata_json(metadata: &PackageMetadata) -> Json {
    Json::Obj(vec![
        ("title".to_string(), opt_str(metadata.title.as_deref())),
        (
            "creators".to_string(),
            Json::Arr(metadata.creators.iter().cloned().map(Json::Str).collect()),
        ),
        ("language".to_string(), opt_str(metadata.language.as_deref())),
        ("identifier".to_string(), opt_str(metadata.identifier.as_deref())),
        ("publisher".to_string(), opt_str(metadata.publisher.as_deref())),
        ("fixed_layout".to_string(), Json::Bool(metadata.is_fixed_layout())),
    ])
}

fn diagnostic_json(diag: &Diagnostic) -> Json {
    Json::Obj(vec![
        ("code".to_string(), Json::Str(diag.code.to_string())),
        ("severity".to_string(), Json::Str(diag.severity.label().to_string())),
        ("platform".to_string(), Json::Str(diag.platform.tag().to_string())),
        ("message".to_string(), Json::Str(diag.message.clone())),
        ("path".to_string(), opt_str(diag.location.path.as_deref())),
        ("line".to_string(), diag.location.line.map_or(Json::Null, Json::Num)),
        ("spec_ref".to_string(), opt_str(diag.spec_ref)),
        ("hint".to_string(), opt_str(diag.hint.as_deref())),
    ])
}

fn report_text(path: &str, report: &Report) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", path));
    if let Some(metadata) = report.metadata() {
        if let Some(title) = metadata.title.as_deref() {
            out.push_str(&format!("  title: {}\n", title));
        }
        if !metadata.creators.is_empty() {
            out.push_str(&format!("  by: {}\n", metadata.creators.join(", ")));
        }
    }

    if !report.critical_view().is_empty() {
        out.push_str("\nREQUIRES IMMEDIATE ATTENTION\n");
        for group in report.critical_view() {
            out.push_str(&format!("  {}\n", group.platform.display_name()));
            for issue in &group.issues {
                out.push_str(&format!(
                    "    {} (x{}): {}\n      e.g. {}\n",
                    issue.code, issue.count, issue.consequence, issue.first
                ));
            }
        }
    }

    let mut current: Option<Platform> = None;
    for (platform, severity, diagnostics) in report.buckets() {
        if current != Some(platform) {
            out.push_str(&format!("\n{}\n", platform.display_name()));
            current = Some(platform);
        }
        out.push_str(&format!("  {} ({})\n", severity.label(), diagnostics.len()));
        for diag in diagnostics {
            out.push_str(&format!("    {}\n", diag));
            if let Some(hint) = diag.hint.as_deref() {
                out.push_str(&format!("      hint: {}\n", hint));
            }
        }
    }

    let counts = report.counts();
    out.push_str(&format!(
        "\n{} issues, {} warnings, {} info, {} critical\n",
        counts.issues, counts.warnings, counts.info, counts.critical
    ));
    out
}

fn print_help() {
    let help = r#"mu-epub-lint - predict EPUB rendering problems per reading platform

USAGE:
  mu-epub-lint [--json] [--pretty] [--max-ratio N] [--max-entry-size BYTES]
               [--platform TAG]... <epub_path>

OPTIONS:
  --json                 Emit the report as JSON
  --pretty               Indent JSON output
  --max-ratio N          Refuse entries expanding more than N times
  --max-entry-size BYTES Refuse entries larger than BYTES uncompressed
  --platform TAG         Report only on TAG (repeatable): pc_reader,
                         apple_books, kobo, eink, kindle, android

EXIT STATUS:
  0  no ERROR or CRITICAL findings
  1  violations found
  2  the file could not be opened as an EPUB
"#;
    println!("{}", help);
}
