use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use acmi_bridge::acmi::writer::{AcmiWriter, UpdateEncoding};
use acmi_bridge::config::ToolConfig;
use acmi_bridge::logging::{init_logging, level_from_verbosity, parse_log_level, LogOutput};
use acmi_bridge::models::traits::IEpisodeStore;
use acmi_bridge::service::{self, ImportOptions};
use acmi_bridge::simulation::{DemoEngine, FlightPattern};
use acmi_bridge::store::JsonlEpisodeStore;
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info};

const DEFAULT_STORE_DIR: &str = "episodes";

fn build_cli() -> Command {
    let file_arg =
        |help: &'static str| Arg::new("file").value_name("FILE").required(true).help(help);
    let store_arg = || {
        Arg::new("output")
            .short('o')
            .long("output")
            .value_name("DIR")
            .default_value(DEFAULT_STORE_DIR)
            .help("エピソードストアのディレクトリ")
    };
    let run_arg = || {
        Arg::new("run")
            .long("run")
            .value_name("NAME")
            .help("ラン名（省略時は設定値）")
    };
    let prefix_arg = || {
        Arg::new("prefix")
            .long("prefix")
            .value_name("PREFIX")
            .help("agent_id の接頭辞（省略時は設定値、空文字で無効）")
    };

    Command::new("acmi-bridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("強化学習エピソード ⇔ ACMI (Tacview) 変換ツール")
        .long_about("強化学習の飛行エピソードと Tacview の ACMI テキスト形式を相互変換します。\n\
                     Agent.* 拡張プロパティにより報酬・行動・価値推定などを無損失で保持します。")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("設定ファイル(.yaml)のパスを指定")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("詳細出力レベル (-v: デバッグ, -vv: トレース)")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("ログレベル（設定値より優先）")
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("TARGET")
                .global(true)
                .value_parser(["console", "file", "both"])
                .help("ログ出力先（設定値より優先）")
        )
        .subcommand(
            Command::new("import")
                .about("ACMIファイルを取り込んでストアに保存")
                .arg(file_arg("取り込むACMIファイル"))
                .arg(store_arg())
                .arg(run_arg())
                .arg(prefix_arg())
        )
        .subcommand(
            Command::new("batch-import")
                .about("ディレクトリ内のACMIファイルを並列に取り込み")
                .arg(Arg::new("dir").value_name("DIR").required(true).help("入力ディレクトリ"))
                .arg(store_arg())
                .arg(run_arg())
                .arg(prefix_arg())
                .arg(
                    Arg::new("pattern")
                        .long("pattern")
                        .value_name("GLOB")
                        .help("ファイル名パターン")
                )
                .arg(
                    Arg::new("workers")
                        .short('j')
                        .long("workers")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .help("並列数")
                )
        )
        .subcommand(
            Command::new("export")
                .about("ストアのエピソードをACMIファイルに書き出し")
                .arg(
                    Arg::new("store")
                        .value_name("STORE_DIR")
                        .required(true)
                        .help("エピソードストアのディレクトリ")
                )
                .arg(
                    Arg::new("output")
                        .value_name("OUTPUT")
                        .required(true)
                        .help("出力ACMIファイル")
                )
                .arg(run_arg())
                .arg(
                    Arg::new("episode")
                        .long("episode")
                        .value_name("ID")
                        .help("書き出すエピソードID（省略時は全件）")
                )
                .arg(
                    Arg::new("encoding")
                        .long("encoding")
                        .value_name("MODE")
                        .value_parser(["full", "delta"])
                        .help("更新形式（full: 全項目, delta: 差分のみ）")
                )
                .arg(Arg::new("title").long("title").value_name("TEXT").help("ファイルタイトル"))
        )
        .subcommand(
            Command::new("info")
                .about("ACMIファイルの概要を表示")
                .arg(file_arg("対象のACMIファイル"))
        )
        .subcommand(
            Command::new("validate")
                .about("ACMIファイルの形式を検証（失敗時は終了コード1）")
                .arg(file_arg("対象のACMIファイル"))
        )
        .subcommand(
            Command::new("convert")
                .about("取り込み → 書き出し → 再取り込みでラウンドトリップを確認")
                .arg(file_arg("対象のACMIファイル"))
                .arg(
                    Arg::new("keep")
                        .long("keep")
                        .action(ArgAction::SetTrue)
                        .help("書き出したファイルを削除せずに残す")
                )
        )
        .subcommand(
            Command::new("demo")
                .about("合成の飛行エピソードを生成")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .default_value("demo.txt.acmi")
                        .help("出力ACMIファイル")
                )
                .arg(
                    Arg::new("store")
                        .long("store")
                        .value_name("DIR")
                        .help("エピソードストアにも保存する")
                )
                .arg(run_arg())
                .arg(
                    Arg::new("agents")
                        .long("agents")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .help("エージェント数")
                )
                .arg(
                    Arg::new("pattern")
                        .long("pattern")
                        .value_name("PATTERN")
                        .value_parser(["straight", "circular"])
                        .help("飛行パターン")
                )
                .arg(
                    Arg::new("duration")
                        .long("duration")
                        .value_name("SECONDS")
                        .value_parser(clap::value_parser!(f64))
                        .help("エピソード長（秒）")
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_name("SEED")
                        .value_parser(clap::value_parser!(u64))
                        .help("シード値")
                )
        )
}

fn main() -> ExitCode {
    let matches = build_cli().get_matches();
    let Some((command, sub)) = matches.subcommand() else {
        return ExitCode::SUCCESS;
    };

    // グローバル引数はサブコマンド側に伝播される
    let verbose = sub.get_count("verbose");

    // 設定ファイルの読み込み
    let config = match sub.get_one::<String>("config") {
        Some(path) => match ToolConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("エラー: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => ToolConfig::default(),
    };

    let mut log_config = config.log_config();
    if let Some(level) = sub.get_one::<String>("log-level") {
        log_config.level = parse_log_level(level);
    }
    log_config.level = level_from_verbosity(log_config.level, verbose);
    if let Some(output) = sub.get_one::<String>("log-output") {
        if let Ok(output) = LogOutput::from_str(output) {
            log_config.output = output;
        }
    }

    // ファイル出力のガードは終了まで保持
    let _guard = match init_logging(log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ログ初期化に失敗しました: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if verbose > 1 {
        config.print_summary();
        println!();
    }

    let result = match command {
        "import" => cmd_import(&config, sub),
        "batch-import" => cmd_batch_import(&config, sub),
        "export" => cmd_export(&config, sub),
        "info" => cmd_info(sub),
        "validate" => cmd_validate(sub),
        "convert" => cmd_convert(&config, sub),
        "demo" => cmd_demo(&config, sub),
        _ => Ok(true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "COMMAND_FAILED: コマンドが失敗しました");
            eprintln!("エラー: {}", e);
            ExitCode::FAILURE
        }
    }
}

type CommandResult = Result<bool, Box<dyn std::error::Error>>;

fn import_options(config: &ToolConfig, sub: &ArgMatches) -> ImportOptions {
    let mut options = ImportOptions::from_config(config);
    if let Some(run) = sub.get_one::<String>("run") {
        options.run_name = run.clone();
    }
    if let Some(prefix) = sub.get_one::<String>("prefix") {
        options.agent_prefix = prefix.clone();
    }
    options
}

fn path_arg(sub: &ArgMatches, name: &str) -> PathBuf {
    sub.get_one::<String>(name).map(PathBuf::from).unwrap_or_default()
}

/// import: 1ファイルを取り込み
fn cmd_import(config: &ToolConfig, sub: &ArgMatches) -> CommandResult {
    let file = path_arg(sub, "file");
    let output = path_arg(sub, "output");
    let report = service::import_acmi(&file, &output, &import_options(config, sub))?;

    println!("取り込み完了: {}", file.display());
    println!("  ラン: {} ({})", report.run_name, output.display());
    println!(
        "  基準点: ({:.6}, {:.6}, {:.1}m)",
        report.reference_point.lat, report.reference_point.lon, report.reference_point.alt
    );
    for episode in &report.episodes {
        println!(
            "  {} / {}: {}ステップ, 報酬 {:.3}, {}",
            episode.agent_id,
            episode.episode_id,
            episode.total_steps,
            episode.total_reward,
            if episode.success { "成功" } else { "失敗" }
        );
    }
    print_warnings(&report.warnings);
    Ok(true)
}

/// batch-import: ディレクトリを一括取り込み
fn cmd_batch_import(config: &ToolConfig, sub: &ArgMatches) -> CommandResult {
    let dir = path_arg(sub, "dir");
    let output = path_arg(sub, "output");
    let pattern = sub
        .get_one::<String>("pattern")
        .cloned()
        .unwrap_or_else(|| config.import.pattern.clone());
    let workers = sub.get_one::<usize>("workers").copied().unwrap_or(config.import.workers);

    let options = import_options(config, sub);
    let report = service::batch_import_acmi(&dir, &output, &pattern, workers, &options)?;

    println!("=== バッチ取り込み結果 ===");
    for entry in &report.entries {
        match (&entry.report, &entry.error) {
            (Some(imported), _) => println!(
                "✓ {}: {}エピソード, 警告{}件",
                entry.file.display(),
                imported.episodes.len(),
                imported.warnings.len()
            ),
            (None, Some(message)) => println!("✗ {}: {}", entry.file.display(), message),
            (None, None) => {}
        }
    }
    println!();
    println!(
        "成功: {} / 失敗: {} / エピソード合計: {}",
        report.succeeded(),
        report.failed(),
        report.total_episodes()
    );
    Ok(report.failed() == 0)
}

/// export: ストアからACMIに書き出し
fn cmd_export(config: &ToolConfig, sub: &ArgMatches) -> CommandResult {
    let store = path_arg(sub, "store");
    let output = path_arg(sub, "output");
    let run = sub
        .get_one::<String>("run")
        .cloned()
        .unwrap_or_else(|| config.import.run_name.clone());

    let mut options = config.writer_options();
    if let Some(encoding) = sub.get_one::<String>("encoding") {
        options.encoding = UpdateEncoding::from_str(encoding)?;
    }
    if let Some(title) = sub.get_one::<String>("title") {
        options.title = Some(title.clone());
    }

    let episode = sub.get_one::<String>("episode").map(String::as_str);
    let count = service::export_to_acmi(&store, &output, &run, episode, &options)?;
    println!("{}エピソードを書き出しました: {}", count, output.display());
    Ok(true)
}

/// info: ファイル概要を表示
fn cmd_info(sub: &ArgMatches) -> CommandResult {
    let file = path_arg(sub, "file");
    let summary = service::inspect_acmi(&file)?;

    println!("=== ファイル情報 ===");
    println!("ファイル: {}", summary.file.display());
    println!("形式: {}", summary.file_type.as_deref().unwrap_or("(なし)"));
    println!("バージョン: {}", summary.file_version.as_deref().unwrap_or("(なし)"));
    if let Some(reference_time) = summary.reference_time {
        println!("基準時刻: {}", reference_time.to_rfc3339());
    }
    if let Some((start, end)) = summary.time_span {
        println!("時間範囲: {:.2}秒 - {:.2}秒 ({}フレーム)", start, end, summary.frames);
    }
    println!();

    println!("=== グローバルプロパティ ===");
    for (key, value) in &summary.globals {
        println!("  {} = {}", key, value);
    }
    println!();

    println!("=== オブジェクト ({}) ===", summary.objects.len());
    for object in &summary.objects {
        println!(
            "  {}: {} - {}スナップショット, {:.2}秒{}",
            object.id,
            object.name.as_deref().unwrap_or("(名前なし)"),
            object.snapshots,
            object.duration,
            object.removed_at.map(|t| format!(", 削除 {:.2}秒", t)).unwrap_or_default()
        );
    }
    println!();

    println!("=== イベント ({}) ===", summary.events.len());
    for (time, event_type, message) in summary.events.iter().take(5) {
        println!("  [{:.2}秒] {}: {}", time, event_type, message);
    }
    if summary.events.len() > 5 {
        println!("  ... 他{}件", summary.events.len() - 5);
    }
    println!();

    if summary.cam_keys.is_empty() {
        println!("Agent.* 拡張プロパティ: なし");
    } else {
        println!("Agent.* 拡張プロパティ: {}種類", summary.cam_keys.len());
        for key in summary.cam_keys.iter().take(10) {
            println!("  {}", key);
        }
        if summary.cam_keys.len() > 10 {
            println!("  ... 他{}種類", summary.cam_keys.len() - 10);
        }
    }
    print_warnings(&summary.warnings);
    Ok(true)
}

/// validate: 形式を検証
fn cmd_validate(sub: &ArgMatches) -> CommandResult {
    let file = path_arg(sub, "file");
    let report = service::validate_acmi(&file)?;

    print_warnings(&report.warnings);
    match &report.error {
        None => {
            println!(
                "✓ 有効なACMIファイルです: {} (オブジェクト{}, イベント{}, エピソード{})",
                file.display(),
                report.objects,
                report.events,
                report.episodes
            );
            Ok(true)
        }
        Some(message) => {
            println!("✗ 無効なACMIファイルです: {}", file.display());
            println!("  {}", message);
            Ok(false)
        }
    }
}

/// convert: ラウンドトリップ確認
fn cmd_convert(config: &ToolConfig, sub: &ArgMatches) -> CommandResult {
    let file = path_arg(sub, "file");
    let report = service::roundtrip_acmi(&file, sub.get_flag("keep"), &config.writer_options())?;

    println!("{}エピソードを変換しました: {}", report.episodes, report.input.display());
    if report.kept {
        println!("出力: {}", report.output.display());
    }
    if report.verified() {
        println!("✓ ラウンドトリップ一致");
        Ok(true)
    } else {
        println!("✗ ラウンドトリップ不一致");
        for mismatch in &report.mismatches {
            println!("  {}", mismatch);
        }
        Ok(false)
    }
}

/// demo: 合成エピソードを生成
fn cmd_demo(config: &ToolConfig, sub: &ArgMatches) -> CommandResult {
    let mut demo = config.demo.clone();
    if let Some(agents) = sub.get_one::<usize>("agents") {
        demo.agents = (*agents).max(1);
    }
    if let Some(pattern) = sub.get_one::<String>("pattern") {
        demo.pattern = FlightPattern::from_str(pattern)?;
    }
    if let Some(duration) = sub.get_one::<f64>("duration") {
        demo.t_max_s = *duration;
    }
    if let Some(seed) = sub.get_one::<u64>("seed") {
        demo.seed = *seed;
    }
    if demo.t_max_s <= 0.0 {
        return Err("エピソード長は正の値を指定してください".into());
    }

    let start_time = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    let mut engine = DemoEngine::new(&demo, start_time);
    engine.initialize();
    let episodes = engine.run();

    let output = path_arg(sub, "output");
    ensure_parent(&output)?;
    AcmiWriter::new(config.writer_options()).write_file(&episodes, &output)?;
    println!("{}エピソードを書き出しました: {}", episodes.len(), output.display());

    if let Some(store_dir) = sub.get_one::<String>("store") {
        let run = sub.get_one::<String>("run").cloned().unwrap_or_else(|| "demo".to_string());
        let mut store = JsonlEpisodeStore::new(store_dir);
        for episode in &episodes {
            store.append(&run, episode)?;
        }
        info!(run = %run, store = %store_dir, "DEMO_STORED: デモエピソードを保存しました");
        println!("ストアに保存しました: {} (ラン: {})", store_dir, run);
    }
    Ok(true)
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn print_warnings(warnings: &[acmi_bridge::acmi::AcmiWarning]) {
    if warnings.is_empty() {
        return;
    }
    println!();
    println!("警告 ({}件):", warnings.len());
    for warning in warnings {
        println!("  - {}", warning);
    }
}
