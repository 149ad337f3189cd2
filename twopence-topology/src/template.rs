//! `@KEY@` substitution for instance templates such as Vagrantfiles.
//!
//! A line referencing a list variable is emitted once per value; a list
//! with no values drops the line. `@@` is a literal `@`.

use crate::error::{BackendError, BackendResult};
use regex::Regex;
use std::collections::BTreeMap;

const PLACEHOLDER: &str = r"@([A-Z][A-Z0-9_]*)@";

/// Vagrantfile used when the backend settings name no template
pub const DEFAULT_VAGRANTFILE: &str = r#"# Generated by twopence-provision
Vagrant.configure("2") do |config|
  config.vm.box = "@BOX@"
  config.vm.box_url = "@BOX_URL@"
  config.vm.hostname = "@HOSTNAME@"
  config.ssh.private_key_path = "@KEYFILE@"

  config.vm.provision "shell", inline: <<-SHELL
    @ADD_REPOSITORIES@
    @INSTALL_PACKAGES@
    @COMMANDS@
  SHELL
end
"#;

/// Variables of a template, each holding zero or more values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    vars: BTreeMap<String, Vec<String>>,
}

impl TemplateVars {
    /// No variables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single-valued variable.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let _ = self.vars.insert(key.to_string(), vec![value.into()]);
    }

    /// Set a single-valued variable if a value is present, else an empty list.
    pub fn set_opt(&mut self, key: &str, value: Option<&str>) {
        let values = value.map(str::to_string).into_iter().collect();
        let _ = self.vars.insert(key.to_string(), values);
    }

    /// Set a list variable.
    pub fn set_list<I, S>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _ = self
            .vars
            .insert(key.to_string(), values.into_iter().map(Into::into).collect());
    }

    /// Substitute every placeholder of `template`.
    ///
    /// # Errors
    ///
    /// `Template` for placeholders without a variable, or a line combining
    /// two list variables.
    pub fn render(&self, template: &str) -> BackendResult<String> {
        let placeholder =
            Regex::new(PLACEHOLDER).map_err(|err| BackendError::Template(err.to_string()))?;
        let mut out = String::with_capacity(template.len());
        for (lineno, line) in template.lines().enumerate() {
            for expanded in self.expand_line(&placeholder, line, lineno + 1)? {
                out.push_str(&expanded.replace("@@", "@"));
                out.push('\n');
            }
        }
        Ok(out)
    }

    fn expand_line(&self, placeholder: &Regex, line: &str, lineno: usize) -> BackendResult<Vec<String>> {
        let masked = line.replace("@@", "\u{0}\u{0}");
        let mut list_key: Option<&str> = None;
        for caps in placeholder.captures_iter(&masked) {
            let key = caps.get(1).map_or("", |m| m.as_str());
            let values = self.vars.get(key).ok_or_else(|| {
                BackendError::Template(format!("line {lineno}: unknown key @{key}@"))
            })?;
            if values.len() != 1 {
                match list_key {
                    Some(other) if other != key => {
                        return Err(BackendError::Template(format!(
                            "line {lineno}: @{other}@ and @{key}@ cannot expand on the same line"
                        )));
                    }
                    _ => list_key = self.vars.get_key_value(key).map(|(k, _)| k.as_str()),
                }
            }
        }

        let substitute = |value_of: &dyn Fn(&str) -> String| {
            placeholder
                .replace_all(&masked, |caps: &regex::Captures<'_>| value_of(&caps[1]))
                .replace('\u{0}', "@")
        };
        let single = |key: &str| {
            self.vars
                .get(key)
                .and_then(|values| values.first())
                .cloned()
                .unwrap_or_default()
        };

        match list_key {
            None => Ok(vec![substitute(&single)]),
            Some(list) => Ok(self.vars[list]
                .iter()
                .map(|value| {
                    substitute(&|key: &str| {
                        if key == list {
                            value.clone()
                        } else {
                            single(key)
                        }
                    })
                })
                .collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_and_list_expansion() {
        let mut vars = TemplateVars::new();
        vars.set("HOST", "client");
        vars.set_list("PKGS", ["vim", "less"]);
        vars.set_list("NONE", Vec::<String>::new());

        let out = vars
            .render("host @HOST@\n  install @PKGS@ on @HOST@\nskipped @NONE@\nmail root@@example.com\n")
            .unwrap();
        assert_eq!(
            out,
            "host client\n  install vim on client\n  install less on client\nmail root@example.com\n"
        );
    }

    #[test]
    fn test_unknown_key() {
        let vars = TemplateVars::new();
        let err = vars.render("ok\nbox @BOX@\n").unwrap_err();
        assert!(matches!(err, BackendError::Template(ref msg) if msg.contains("line 2") && msg.contains("@BOX@")));
    }

    #[test]
    fn test_two_lists_on_one_line() {
        let mut vars = TemplateVars::new();
        vars.set_list("A", ["1", "2"]);
        vars.set_list("B", ["x", "y"]);
        assert!(vars.render("@A@ @B@").is_err());
    }

    #[test]
    fn test_default_vagrantfile_renders() {
        let mut vars = TemplateVars::new();
        for key in ["BOX", "BOX_URL", "HOSTNAME", "KEYFILE"] {
            vars.set(key, "x");
        }
        vars.set_list("ADD_REPOSITORIES", ["zypper ar repo"]);
        vars.set_list("INSTALL_PACKAGES", Vec::<String>::new());
        vars.set_list("COMMANDS", ["systemctl enable --now sshd"]);

        let out = vars.render(DEFAULT_VAGRANTFILE).unwrap();
        assert!(out.contains("config.vm.box = \"x\""));
        assert!(out.contains("    zypper ar repo\n"));
        assert!(!out.contains('@'));
    }
}
