//! # Template Renderer
//!
//! Loads a directory of text templates at startup and renders them by
//! literal `%{variable}` substitution. Manifest templates (`*.yaml`) are
//! safe-parsed after rendering; partials (`*.yml`, `*.sh`) stay text and are
//! embedded into manifests by the caller.
//!
//! Values are plain strings; callers pass structured or multiline content as
//! pre-serialized JSON fragments, which embed into YAML unchanged.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable pattern is valid")
});

/// A single template: raw text plus the variable names it references.
#[derive(Debug, Clone)]
pub struct Template {
    file_name: String,
    text: String,
    variables: BTreeSet<String>,
}

impl Template {
    fn parse(file_name: String, text: String) -> Self {
        let variables = VARIABLE
            .captures_iter(&text)
            .map(|c| c[1].to_string())
            .collect();
        Self {
            file_name,
            text,
            variables,
        }
    }

    fn is_yaml(&self) -> bool {
        self.file_name.ends_with(".yaml")
    }
}

/// The result of rendering: parsed YAML for manifest templates, verbatim
/// text for partials.
#[derive(Debug, Clone)]
pub enum Rendered {
    Manifest(serde_json::Value),
    Text(String),
}

/// Named templates, indexed by file basename before the first `.`.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<String, Template>,
}

impl TemplateSet {
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|source| Error::TemplateDir {
            path: dir.display().to_string(),
            source,
        })?;

        let mut templates = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::TemplateDir {
                path: dir.display().to_string(),
                source,
            })?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = file_name
                .split('.')
                .next()
                .unwrap_or(&file_name)
                .to_string();
            let text =
                std::fs::read_to_string(entry.path()).map_err(|source| Error::TemplateDir {
                    path: entry.path().display().to_string(),
                    source,
                })?;
            templates.insert(name, Template::parse(file_name, text));
        }

        Ok(Self { templates })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Renders `name` with the given variables. Every variable the template
    /// references must be present; extras are ignored.
    pub fn render(&self, name: &str, vars: &BTreeMap<&str, String>) -> Result<Rendered> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| Error::UnknownTemplate(name.into()))?;

        let missing: Vec<String> = template
            .variables
            .iter()
            .filter(|v| !vars.contains_key(v.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingTemplateVariables {
                template: name.into(),
                variables: missing,
            });
        }

        let text = VARIABLE.replace_all(&template.text, |caps: &regex::Captures<'_>| {
            vars[&caps[1]].clone()
        });

        if template.is_yaml() {
            let value: serde_json::Value =
                serde_yaml::from_str(&text).map_err(|source| Error::InvalidTemplateYaml {
                    template: name.into(),
                    source,
                })?;
            Ok(Rendered::Manifest(value))
        } else {
            Ok(Rendered::Text(text.into_owned()))
        }
    }

    /// Renders a manifest template, erroring if `name` is a text partial.
    pub fn render_manifest(
        &self,
        name: &str,
        vars: &BTreeMap<&str, String>,
    ) -> Result<serde_json::Value> {
        match self.render(name, vars)? {
            Rendered::Manifest(value) => Ok(value),
            Rendered::Text(_) => Err(Error::UnknownTemplate(format!("{name} (not a manifest)"))),
        }
    }

    /// Renders a text partial such as `_internal_users` or `_startup_script`.
    pub fn render_text(&self, name: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
        match self.render(name, vars)? {
            Rendered::Text(text) => Ok(text),
            Rendered::Manifest(_) => Err(Error::UnknownTemplate(format!("{name} (not text)"))),
        }
    }
}

/// Quotes a string as a JSON literal for embedding into a YAML template.
pub fn json_string(value: &str) -> String {
    serde_json::Value::String(value.into()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn set_with(files: &[(&str, &str)]) -> TemplateSet {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, content) in files {
            let mut file = std::fs::File::create(dir.path().join(name)).expect("create");
            file.write_all(content.as_bytes()).expect("write");
        }
        TemplateSet::load(dir.path()).expect("load")
    }

    fn vars(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_indexes_by_basename_before_first_dot() {
        let set = set_with(&[
            ("service.yaml", "kind: Service"),
            ("_internal_users.yml", "users: %{admin_hash}"),
            ("_startup_script.sh", "echo hi"),
        ]);
        let mut names: Vec<&str> = set.names().collect();
        names.sort_unstable();
        assert_eq!(names, ["_internal_users", "_startup_script", "service"]);
    }

    #[test]
    fn test_substitutes_variables() {
        let set = set_with(&[("greeting.txt", "hello %{name}, hello %{name} again")]);
        let text = set
            .render_text("greeting", &vars(&[("name", "world")]))
            .unwrap();
        assert_eq!(text, "hello world, hello world again");
    }

    #[test]
    fn test_missing_variables_error_names_template_and_set() {
        let set = set_with(&[("thing.yaml", "a: %{a}\nb: %{b}\n")]);
        let err = set.render("thing", &vars(&[("a", "1")])).unwrap_err();
        match err {
            Error::MissingTemplateVariables {
                template,
                variables,
            } => {
                assert_eq!(template, "thing");
                assert_eq!(variables, vec!["b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_yaml_templates_parse_after_render() {
        let set = set_with(&[("secret.yaml", "kind: Secret\nmetadata:\n  name: %{name}\n")]);
        let manifest = set
            .render_manifest("secret", &vars(&[("name", "creds")]))
            .unwrap();
        assert_eq!(manifest["kind"], "Secret");
        assert_eq!(manifest["metadata"]["name"], "creds");
    }

    #[test]
    fn test_non_yaml_templates_stay_text() {
        let set = set_with(&[("_roles.yml", "metrics_role:\n  reserved: true\n")]);
        match set.render("_roles", &BTreeMap::new()).unwrap() {
            Rendered::Text(text) => assert!(text.contains("metrics_role")),
            Rendered::Manifest(_) => panic!(".yml must not be parsed"),
        }
    }

    #[test]
    fn test_invalid_yaml_after_render_is_an_error() {
        let set = set_with(&[("bad.yaml", "a: [%{v}")]);
        let err = set.render("bad", &vars(&[("v", "1")])).unwrap_err();
        assert!(matches!(err, Error::InvalidTemplateYaml { .. }));
    }

    #[test]
    fn test_json_fragments_embed_into_yaml() {
        let set = set_with(&[("cm.yaml", "data:\n  users.yml: %{users}\n")]);
        let users = json_string("admin:\n  hash: xyz\n");
        let manifest = set.render_manifest("cm", &vars(&[("users", &users)])).unwrap();
        assert_eq!(manifest["data"]["users.yml"], "admin:\n  hash: xyz\n");
    }

    #[test]
    fn test_unknown_template() {
        let set = set_with(&[]);
        assert!(matches!(
            set.render("nope", &BTreeMap::new()),
            Err(Error::UnknownTemplate(_))
        ));
    }
}
