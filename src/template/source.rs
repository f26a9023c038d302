//! # 模板来源
//!
//! 从配置目录下的 templates.yaml 读取自定义模板，缺省时使用内置模板。
//! 引擎只把模板当作只读输入，远程模板的下载不在本工具范围内。

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::defaults::DEFAULT_TEMPLATES;
use super::{Category, Sections, Template};

/// 模板文件格式
#[derive(Debug, Default, Serialize, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    templates: Vec<Template>,
}

/// 模板来源接口
pub trait TemplateSource {
    /// 所有可用模板
    fn templates(&self) -> Vec<&Template>;

    /// 按名称查找模板
    fn get(&self, name: &str) -> Option<&Template> {
        self.templates().into_iter().find(|t| t.name == name)
    }

    /// 获取指定类别的基础段（取该类别的第一个模板）
    fn base_sections(&self, category: Category) -> Option<&Sections> {
        self.templates()
            .into_iter()
            .find(|t| t.category == category)
            .map(|t| &t.sections)
    }

    /// 所有模板中已定义的策略组
    fn known_proxy_groups(&self) -> BTreeSet<String> {
        self.templates()
            .into_iter()
            .flat_map(|t| t.proxy_groups.iter().cloned())
            .collect()
    }
}

/// 模板存储：自定义模板优先，同名时覆盖内置模板
pub struct TemplateStore {
    /// templates.yaml 路径
    path: Option<PathBuf>,
    /// 用户导入的模板
    custom: Vec<Template>,
    /// 内置模板
    builtin: Vec<Template>,
}

impl TemplateStore {
    /// 加载模板文件，文件不存在时只有内置模板
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut store = Self::builtin_only()?;
        store.path = Some(path.to_path_buf());

        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read templates from {}", path.display()))?;
            let file: TemplateFile = serde_yaml_ng::from_str(&content)
                .with_context(|| format!("Malformed template file {}", path.display()))?;
            store.custom = file.templates;
            log::debug!(
                "Loaded {} custom templates from {}",
                store.custom.len(),
                path.display()
            );
        }

        Ok(store)
    }

    /// 只包含内置模板
    pub fn builtin_only() -> Result<Self> {
        let file: TemplateFile = serde_yaml_ng::from_str(DEFAULT_TEMPLATES)
            .context("Built-in templates are malformed")?;
        Ok(Self {
            path: None,
            custom: Vec::new(),
            builtin: file.templates,
        })
    }

    /// 模板是否为内置模板
    pub fn is_builtin(&self, name: &str) -> bool {
        !self.custom.iter().any(|t| t.name == name) && self.builtin.iter().any(|t| t.name == name)
    }

    /// 导入模板，同名时替换，返回被替换的旧模板
    pub fn import(&mut self, template: Template) -> Result<Option<Template>> {
        if template.name.trim().is_empty() {
            bail!("Template name must not be empty");
        }

        match self.custom.iter_mut().find(|t| t.name == template.name) {
            Some(existing) => Ok(Some(std::mem::replace(existing, template))),
            None => {
                self.custom.push(template);
                Ok(None)
            }
        }
    }

    /// 从 YAML 文件导入模板，文件可以是单个模板或 `templates:` 列表
    pub fn import_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Vec<String>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let templates = parse_templates(&content)
            .with_context(|| format!("Malformed template file {}", path.display()))?;

        let mut names = Vec::new();
        for template in templates {
            names.push(template.name.clone());
            self.import(template)?;
        }
        Ok(names)
    }

    /// 把自定义模板写回 templates.yaml
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            bail!("Template store has no backing file");
        };

        let file = TemplateFile {
            templates: self.custom.clone(),
        };
        let yaml = serde_yaml_ng::to_string(&file)?;
        fs::write(path, yaml)
            .with_context(|| format!("Failed to write templates to {}", path.display()))?;
        Ok(())
    }
}

impl TemplateSource for TemplateStore {
    fn templates(&self) -> Vec<&Template> {
        self.custom
            .iter()
            .chain(
                self.builtin
                    .iter()
                    .filter(|b| !self.custom.iter().any(|c| c.name == b.name)),
            )
            .collect()
    }
}

/// 解析模板文本：先按列表格式，再按单个模板
fn parse_templates(content: &str) -> Result<Vec<Template>> {
    let file: TemplateFile = serde_yaml_ng::from_str(content)?;
    if !file.templates.is_empty() {
        return Ok(file.templates);
    }

    let single: Template = serde_yaml_ng::from_str(content)?;
    Ok(vec![single])
}
