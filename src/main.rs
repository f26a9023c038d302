//! # rule-overlay
//!
//! 把自定义覆写（DNS、分流规则、规则集）叠加到 Clash / Surge 基础模板上，
//! 确定性地合成最终配置。
//!
//! ## 功能
//! - 管理自定义覆写，三种合并模式:
//!   - REPLACE: 整体替换模板中的对应段（每个种类最多启用一条）
//!   - PREPEND: 插入到段首
//!   - APPEND: 追加到段尾
//! - 从内置规则集预设生成规则集条目和伴随分流规则
//! - 按模板合成并输出最终配置
//!
//! ## 使用
//! ```bash
//! # 追加一条分流规则
//! rule-overlay overlay add --kind routing --line "DOMAIN-SUFFIX,example.com,Proxy"
//!
//! # 用文件整体替换 DNS 段
//! rule-overlay overlay add --kind dns --file dns.yaml
//!
//! # 添加 GFWList 规则集及其伴随规则
//! rule-overlay preset apply gfw
//!
//! # 输出合成后的 Clash 配置
//! rule-overlay generate --category clash
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rayon::prelude::*;

mod config;
mod engine;
mod overlay;
mod preset;
mod template;

use config::AppPaths;
use engine::{compose_document, EngineError, OverlayService};
use overlay::{content_from_text, JsonStore, NewOverlay, Overlay, OverlayKind, OverlayMode, OverlayPatch};
use preset::{short_url, PresetCatalog};
use template::{create_dialect, Category, Sections, TemplateSource, TemplateStore};

// ========================================
// CLI 参数定义
// ========================================

/// 规则覆写合成工具
#[derive(Parser)]
#[command(name = "rule-overlay")]
#[command(version = "0.1.0")]
#[command(about = "Compose custom DNS / routing / rule-provider overlays onto Clash and Surge templates")]
struct Cli {
    /// 数据目录 (默认 ~/.config/rule-overlay，也可用 RULE_OVERLAY_HOME 指定)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// 显示调试日志
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// 子命令
    #[command(subcommand)]
    command: Commands,
}

/// 支持的子命令
#[derive(Subcommand)]
enum Commands {
    /// 管理自定义覆写
    #[command(subcommand)]
    Overlay(OverlayCommand),

    /// 查看和应用规则集预设
    #[command(subcommand)]
    Preset(PresetCommand),

    /// 管理基础模板
    #[command(subcommand)]
    Template(TemplateCommand),

    /// 合成最终配置
    Generate {
        /// 输出类别 (默认 clash)
        #[arg(long, value_enum)]
        category: Option<Category>,

        /// 指定模板名称 (优先于 --category)
        #[arg(long, conflicts_with = "category")]
        template: Option<String>,

        /// 合成所有模板，写入输出目录
        #[arg(long, conflicts_with_all = ["category", "template"])]
        all: bool,

        /// 输出文件 (--all 时为输出目录)
        #[arg(long, short = 'o', value_name = "PATH")]
        out: Option<PathBuf>,
    },
}

/// 覆写内容来源
#[derive(Args)]
struct ContentArgs {
    /// 从文件读取内容
    #[arg(long, value_name = "PATH", conflicts_with = "lines")]
    file: Option<PathBuf>,

    /// 逐行指定内容 (可重复)
    #[arg(long = "line", value_name = "LINE")]
    lines: Vec<String>,
}

impl ContentArgs {
    /// 读取内容，未指定时返回 None
    fn read(&self) -> Result<Option<Vec<String>>> {
        if let Some(path) = &self.file {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            return Ok(Some(content_from_text(&text)));
        }
        if self.lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.lines.clone()))
    }
}

#[derive(Subcommand)]
enum OverlayCommand {
    /// 新建覆写
    Add {
        /// 覆写种类
        #[arg(long, value_enum)]
        kind: OverlayKind,

        /// 合并模式 (DNS 默认 replace，其他默认 append)
        #[arg(long, value_enum)]
        mode: Option<OverlayMode>,

        /// 显示名称
        #[arg(long)]
        name: Option<String>,

        /// 只参与该类别模板的合成 (默认所有类别)
        #[arg(long, value_enum)]
        category: Option<Category>,

        /// 创建后不启用
        #[arg(long)]
        disabled: bool,

        #[command(flatten)]
        content: ContentArgs,
    },
    /// 修改覆写
    Edit {
        id: u64,

        #[arg(long, value_enum)]
        kind: Option<OverlayKind>,

        #[arg(long, value_enum)]
        mode: Option<OverlayMode>,

        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        content: ContentArgs,
    },
    /// 启用覆写 (REPLACE 模式会停用同种类的其他 REPLACE 覆写)
    Enable { id: u64 },
    /// 停用覆写
    Disable { id: u64 },
    /// 删除覆写
    Delete { id: u64 },
    /// 列出覆写
    List {
        /// 按种类过滤
        #[arg(long, value_enum)]
        kind: Option<OverlayKind>,

        /// JSON 格式输出
        #[arg(long)]
        json: bool,
    },
    /// 查看覆写详情
    Show {
        id: u64,

        /// JSON 格式输出
        #[arg(long)]
        json: bool,
    },
    /// 检查每个种类是否最多只有一条启用的 REPLACE 覆写
    Check {
        /// 保留最新的一条，停用其余
        #[arg(long)]
        fix: bool,
    },
}

#[derive(Subcommand)]
enum PresetCommand {
    /// 列出预设
    List {
        /// 只显示尚未被模板使用的预设
        #[arg(long)]
        available: bool,

        /// JSON 格式输出
        #[arg(long)]
        json: bool,
    },
    /// 查看预设详情
    Show { key: String },
    /// 预览预设的伴随规则 (已与现有分流覆写去重)
    Derive { key: String },
    /// 把预设落地为规则集覆写和伴随分流覆写
    Apply {
        key: String,

        /// 规则集条目的格式
        #[arg(long, value_enum, default_value_t = Category::Clash)]
        category: Category,

        /// 伴随分流覆写的合并模式
        #[arg(long, value_enum, default_value_t = OverlayMode::Prepend)]
        rule_mode: OverlayMode,
    },
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// 列出模板
    List,
    /// 渲染模板的基础内容 (不含覆写)
    Show { name: String },
    /// 从本地 YAML 文件导入模板
    Import { file: PathBuf },
}

// ========================================
// 主函数
// ========================================

fn main() {
    // 解析命令行参数
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let result = AppPaths::resolve(cli.data_dir).and_then(|paths| {
        let app = App::open(paths)?;
        match cli.command {
            Commands::Overlay(cmd) => run_overlay(&app, cmd),
            Commands::Preset(cmd) => run_preset(&app, cmd),
            Commands::Template(cmd) => run_template(app, cmd),
            Commands::Generate {
                category,
                template,
                all,
                out,
            } => run_generate(&app, category, template, all, out),
        }
    });

    // 处理错误
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// 初始化日志，RUST_LOG 优先于 --verbose
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

/// 命令执行上下文
struct App {
    paths: AppPaths,
    templates: TemplateStore,
    service: OverlayService<JsonStore>,
}

impl App {
    fn open(paths: AppPaths) -> Result<Self> {
        paths.ensure_dir()?;

        let templates = TemplateStore::load(&paths.templates_file)?;
        let store = JsonStore::open(&paths.overlays_file).with_context(|| {
            format!("Failed to open overlay store {}", paths.overlays_file.display())
        })?;
        let service = OverlayService::new(store).with_known_groups(templates.known_proxy_groups());

        Ok(Self {
            paths,
            templates,
            service,
        })
    }
}

// ========================================
// overlay 子命令
// ========================================

fn run_overlay(app: &App, cmd: OverlayCommand) -> Result<()> {
    let service = &app.service;

    match cmd {
        OverlayCommand::Add {
            kind,
            mode,
            name,
            category,
            disabled,
            content,
        } => {
            let mode = mode.unwrap_or(match kind {
                OverlayKind::Dns => OverlayMode::Replace,
                _ => OverlayMode::Append,
            });
            let content = content.read()?.unwrap_or_default();
            let name = name.unwrap_or_else(|| format!("{} {}", kind, mode).to_lowercase());

            let created = service.create(
                NewOverlay::new(kind, mode, content)
                    .with_name(name)
                    .with_category(category)
                    .with_enabled(!disabled),
            )?;
            println!(
                "Created overlay #{} ({} {}, {})",
                created.id,
                created.kind,
                created.mode,
                enabled_label(created.enabled)
            );
            print_new_groups(&created);
        }
        OverlayCommand::Edit {
            id,
            kind,
            mode,
            name,
            content,
        } => {
            let patch = OverlayPatch {
                kind,
                mode,
                name,
                content: content.read()?,
                ..Default::default()
            };
            if patch.is_empty() {
                bail!("Nothing to update, pass at least one of --kind/--mode/--name/--file/--line");
            }

            let updated = service.update(id, patch)?;
            println!(
                "Updated overlay #{} ({} {}, {})",
                updated.id,
                updated.kind,
                updated.mode,
                enabled_label(updated.enabled)
            );
            print_new_groups(&updated);
        }
        OverlayCommand::Enable { id } => {
            let before = service.list(None)?;
            let enabled = service.set_enabled(id, true)?;
            println!("Enabled overlay #{}", enabled.id);

            // 报告被级联停用的覆写
            for overlay in before.iter().filter(|o| o.id != id && o.is_active_replace()) {
                if !service.get(overlay.id)?.enabled {
                    println!("Deactivated conflicting overlay #{} ({})", overlay.id, overlay.name);
                }
            }
        }
        OverlayCommand::Disable { id } => {
            service.set_enabled(id, false)?;
            println!("Disabled overlay #{}", id);
        }
        OverlayCommand::Delete { id } => {
            service.delete(id)?;
            println!("Deleted overlay #{}", id);
        }
        OverlayCommand::List { kind, json } => {
            let overlays = service.list(kind)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&overlays)?);
                return Ok(());
            }

            println!(
                "{:<6}\t{:<14}\t{:<8}\t{:<8}\t{:<8}\t{:<6}\t{}",
                "ID", "KIND", "MODE", "CATEGORY", "STATE", "LINES", "NAME"
            );
            for o in &overlays {
                println!(
                    "{:<6}\t{:<14}\t{:<8}\t{:<8}\t{:<8}\t{:<6}\t{}",
                    o.id,
                    o.kind.to_string(),
                    o.mode.to_string(),
                    category_label(o.category),
                    enabled_label(o.enabled),
                    o.content.len(),
                    truncate(&o.name, 40)
                );
            }
            println!("\nTotal: {} overlays", overlays.len());
        }
        OverlayCommand::Show { id, json } => {
            let overlay = service.get(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&overlay)?);
                return Ok(());
            }

            println!("ID:       {}", overlay.id);
            println!("Name:     {}", overlay.name);
            println!("Kind:     {}", overlay.kind);
            println!("Mode:     {}", overlay.mode);
            println!("Category: {}", category_label(overlay.category));
            println!("State:    {}", enabled_label(overlay.enabled));
            println!("Created:  {}", overlay.created_at.to_rfc3339());
            println!("Updated:  {}", overlay.updated_at.to_rfc3339());
            print_new_groups(&overlay);
            println!("Content:");
            for line in &overlay.content {
                println!("  {}", line);
            }
        }
        OverlayCommand::Check { fix } => {
            let violations = service.exclusivity_violations()?;
            if violations.is_empty() {
                println!("OK: at most one enabled REPLACE overlay per kind");
                return Ok(());
            }

            for (kind, ids) in &violations {
                println!("{}: {} enabled REPLACE overlays {:?}", kind, ids.len(), ids);
            }
            if !fix {
                bail!("Exclusivity violated, rerun with --fix to keep only the newest overlay");
            }
            for kept in service.repair_exclusivity()? {
                println!("{}: kept overlay #{}", kept.kind, kept.id);
            }
        }
    }

    Ok(())
}

fn enabled_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

fn category_label(category: Option<Category>) -> String {
    category.map_or_else(|| "all".to_string(), |c| c.to_string())
}

fn print_new_groups(overlay: &Overlay) {
    if let Some(groups) = &overlay.derived_proxy_groups {
        let names: Vec<&str> = groups.iter().map(String::as_str).collect();
        println!(
            "Note: references proxy groups not defined in any template: {}",
            names.join(", ")
        );
    }
}

fn truncate(s: &str, max_width: usize) -> String {
    if s.chars().count() > max_width {
        let head: String = s.chars().take(max_width.saturating_sub(2)).collect();
        format!("{}..", head)
    } else {
        s.to_string()
    }
}

// ========================================
// preset 子命令
// ========================================

fn run_preset(app: &App, cmd: PresetCommand) -> Result<()> {
    let catalog = PresetCatalog::global();

    match cmd {
        PresetCommand::List { available, json } => {
            let presets = if available {
                let templates = app.templates.templates();
                let used_urls = templates.iter().filter_map(|t| t.source_url.as_deref());
                let used_names = templates.iter().map(|t| t.name.as_str());
                catalog.list_available(used_urls, used_names)
            } else {
                catalog.all().iter().collect()
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&presets)?);
                return Ok(());
            }

            println!("{:<14}\t{:<10}\t{:<8}\t{}", "KEY", "BEHAVIOR", "RULES", "NAME");
            for p in &presets {
                println!(
                    "{:<14}\t{:<10}\t{:<8}\t{} ({})",
                    p.key,
                    p.behavior,
                    if p.derived_rule_template.is_some() { "yes" } else { "-" },
                    p.display_name,
                    short_url(p.source_url)
                );
            }
        }
        PresetCommand::Show { key } => {
            let preset = catalog
                .lookup_by_key(&key)
                .ok_or_else(|| EngineError::UnknownPresetKey(key.clone()))?;

            println!("Key:      {}", preset.key);
            println!("Name:     {}", preset.display_name);
            println!("URL:      {}", preset.source_url);
            println!("Behavior: {}", preset.behavior);
            println!("Policy:   {}", preset.policy);
            match preset.derived_rule_template {
                Some(template) => {
                    println!("Rules:");
                    for line in template {
                        println!("  {}", line);
                    }
                }
                None => println!("Rules:    (none)"),
            }
        }
        PresetCommand::Derive { key } => {
            let rules = app.service.derive_companion(catalog, &key)?;
            if rules.is_empty() {
                println!("Preset {} has no companion rules", key);
            }
            for line in rules {
                println!("{}", line);
            }
        }
        PresetCommand::Apply {
            key,
            category,
            rule_mode,
        } => {
            let applied = app
                .service
                .apply_preset(catalog, &key, category, rule_mode)?;
            println!(
                "Created rule-provider overlay #{} for {} ({} templates only)",
                applied.provider.id, key, category
            );
            if let Some(routing) = &applied.routing {
                println!(
                    "Created routing overlay #{} ({})",
                    routing.id, routing.mode
                );
                print_new_groups(routing);
            }
        }
    }

    Ok(())
}

// ========================================
// template 子命令
// ========================================

fn run_template(mut app: App, cmd: TemplateCommand) -> Result<()> {
    match cmd {
        TemplateCommand::List => {
            println!("{:<24}\t{:<8}\t{:<8}\t{}", "NAME", "CATEGORY", "ORIGIN", "SOURCE");
            for t in app.templates.templates() {
                println!(
                    "{:<24}\t{:<8}\t{:<8}\t{}",
                    t.name,
                    t.category.to_string(),
                    if app.templates.is_builtin(&t.name) { "builtin" } else { "custom" },
                    t.source_url.as_deref().unwrap_or("-")
                );
            }
        }
        TemplateCommand::Show { name } => {
            let template = app
                .templates
                .get(&name)
                .with_context(|| format!("Template {} not found", name))?;
            print!("{}", create_dialect(template.category).render(&template.sections));
        }
        TemplateCommand::Import { file } => {
            let names = app.templates.import_file(&file)?;
            app.templates.save()?;
            for name in names {
                println!(
                    "Imported template {} into {}",
                    name,
                    app.paths.templates_file.display()
                );
            }
        }
    }

    Ok(())
}

// ========================================
// generate 子命令
// ========================================

fn run_generate(
    app: &App,
    category: Option<Category>,
    template: Option<String>,
    all: bool,
    out: Option<PathBuf>,
) -> Result<()> {
    let overlays = app.service.enabled_overlays()?;

    if all {
        let out_dir = out.unwrap_or_else(|| app.paths.data_dir.join("output"));
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;

        // 合成是只读的，各模板并行渲染
        let rendered: Vec<(PathBuf, String)> = app
            .templates
            .templates()
            .par_iter()
            .map(|t| {
                let dialect = create_dialect(t.category);
                let file_name = format!("{}.{}", sanitize(&t.name), dialect.file_extension());
                (out_dir.join(file_name), render(t.category, &t.sections, &overlays))
            })
            .collect();

        for (path, text) in rendered {
            write_output(&path, &text)?;
            println!("Wrote {}", path.display());
        }
        return Ok(());
    }

    let (category, base) = match template {
        Some(name) => {
            let t = app
                .templates
                .get(&name)
                .with_context(|| format!("Template {} not found", name))?;
            (t.category, &t.sections)
        }
        None => {
            let category = category.unwrap_or_default();
            let base = app
                .templates
                .base_sections(category)
                .with_context(|| format!("No template for category {}", category))?;
            (category, base)
        }
    };

    let text = render(category, base, &overlays);
    match out {
        Some(path) => {
            write_output(&path, &text)?;
            println!("Wrote {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

/// 合成并渲染一份文档，只使用适用于该类别的覆写
fn render(category: Category, base: &Sections, overlays: &[Overlay]) -> String {
    let scoped: Vec<Overlay> = overlays
        .iter()
        .filter(|o| o.applies_to(category))
        .cloned()
        .collect();
    let sections = compose_document(base, &scoped);
    create_dialect(category).render(&sections)
}

fn write_output(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

/// 模板名转为文件名
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_handles_multibyte() {
        assert_eq!(truncate("广告拦截规则集合", 6), "广告拦截..");
        assert_eq!(truncate("short", 40), "short");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("ACL4SSR Online/Full"), "ACL4SSR-Online-Full");
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::parse_from([
            "rule-overlay",
            "overlay",
            "add",
            "--kind",
            "rule-provider",
            "--line",
            "gfw:",
            "--line",
            "  type: http",
        ]);
        match cli.command {
            Commands::Overlay(OverlayCommand::Add { kind, content, .. }) => {
                assert_eq!(kind, OverlayKind::RuleProvider);
                assert_eq!(content.read().unwrap().unwrap().len(), 2);
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn test_end_to_end_generate() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(AppPaths::in_dir(dir.path())).unwrap();

        run_preset(
            &app,
            PresetCommand::Apply {
                key: "gfw".to_string(),
                category: Category::Clash,
                rule_mode: OverlayMode::Prepend,
            },
        )
        .unwrap();

        let out = dir.path().join("clash.yaml");
        run_generate(&app, Some(Category::Clash), None, false, Some(out.clone())).unwrap();
        let text = fs::read_to_string(&out).unwrap();

        assert!(text.contains("rule-providers:\n  gfw:"));
        let rules = text.split("rules:\n").nth(1).unwrap();
        let first_rule = rules.lines().find(|l| l.trim_start().starts_with("- ")).unwrap();
        assert_eq!(first_rule, "  - RULE-SET,gfw,Proxy");
        assert!(rules.trim_end().ends_with("- MATCH,Proxy"));
    }

    #[test]
    fn test_clash_preset_stays_out_of_surge_output() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(AppPaths::in_dir(dir.path())).unwrap();

        run_preset(
            &app,
            PresetCommand::Apply {
                key: "gfw".to_string(),
                category: Category::Clash,
                rule_mode: OverlayMode::Prepend,
            },
        )
        .unwrap();
        run_overlay(
            &app,
            OverlayCommand::Add {
                kind: OverlayKind::Routing,
                mode: Some(OverlayMode::Prepend),
                name: None,
                category: None,
                disabled: false,
                content: ContentArgs {
                    file: None,
                    lines: vec!["DOMAIN-SUFFIX,example.com,DIRECT".to_string()],
                },
            },
        )
        .unwrap();

        let out = dir.path().join("surge.conf");
        run_generate(&app, Some(Category::Surge), None, false, Some(out.clone())).unwrap();
        let text = fs::read_to_string(&out).unwrap();

        assert!(!text.contains("type: http"));
        assert!(!text.contains("gfw"));
        // 不限类别的覆写仍然参与 Surge 合成
        assert!(text.contains("[Rule]\nDOMAIN-SUFFIX,example.com,DIRECT"));
    }

    #[test]
    fn test_generate_all_scopes_overlays_per_template() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(AppPaths::in_dir(dir.path())).unwrap();

        for category in [Category::Clash, Category::Surge] {
            run_preset(
                &app,
                PresetCommand::Apply {
                    key: "reject".to_string(),
                    category,
                    rule_mode: OverlayMode::Prepend,
                },
            )
            .unwrap();
        }

        let out_dir = dir.path().join("out");
        run_generate(&app, None, None, true, Some(out_dir.clone())).unwrap();

        let clash = fs::read_to_string(out_dir.join("default-clash.yaml")).unwrap();
        let surge = fs::read_to_string(out_dir.join("default-surge.conf")).unwrap();
        assert!(clash.contains("rule-providers:\n  reject:"));
        assert!(!clash.contains("RULE-SET,https://"));
        assert!(surge.contains("RULE-SET,https://"));
        assert!(!surge.contains("type: http"));
    }
}
