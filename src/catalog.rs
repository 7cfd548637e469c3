/// Tool catalog: the flat list of external tools jobs can be dispatched to.
///
/// Each entry names a program and an argument template. `{placeholder}`
/// tokens are filled from caller parameters; a value always stays inside the
/// argument slot it was written into, so nothing is ever word-split.
use crate::category::ToolCategory;
use crate::job::{CommandLine, JobSpec};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: ToolCategory,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Touches the network; hidden unless network tools are allowed.
    #[serde(default)]
    pub network: bool,
}

/// Errors produced when resolving a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    UnknownTool { name: String },
    MissingParam { tool: String, param: String },
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::UnknownTool { name } => write!(f, "unknown tool '{}'", name),
            CatalogError::MissingParam { tool, param } => {
                write!(f, "tool '{}' needs parameter '{}'", tool, param)
            }
        }
    }
}

impl std::error::Error for CatalogError {}

impl ToolSpec {
    fn builtin(
        name: &str,
        category: ToolCategory,
        program: &str,
        args: &[&str],
        description: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            category,
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            network: false,
        }
    }

    /// Placeholder names used by the argument template, in first-use order.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for arg in &self.args {
            for caps in PLACEHOLDER.captures_iter(arg) {
                let name = caps[1].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Resolve the program on `PATH` (or as given, if it contains a slash).
    pub fn locate(&self) -> Option<PathBuf> {
        which::which(&self.program).ok()
    }

    pub fn is_available(&self) -> bool {
        self.locate().is_some()
    }

    /// Fill the argument template from `params`.
    pub fn command_line(&self, params: &HashMap<String, String>) -> Result<CommandLine, CatalogError> {
        if let Some(missing) = self
            .placeholders()
            .into_iter()
            .find(|p| !params.contains_key(p))
        {
            return Err(CatalogError::MissingParam {
                tool: self.name.clone(),
                param: missing,
            });
        }

        let args = self
            .args
            .iter()
            .map(|arg| {
                PLACEHOLDER
                    .replace_all(arg, |caps: &Captures| params[&caps[1]].clone())
                    .into_owned()
            })
            .collect::<Vec<_>>();
        Ok(CommandLine::new(self.program.clone(), args))
    }

    /// Build a job for this tool under `job_name`.
    pub fn job(
        &self,
        job_name: impl Into<String>,
        params: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<JobSpec, CatalogError> {
        let command = self.command_line(params)?;
        let mut spec = JobSpec::new(job_name, self.category.clone(), command.program, command.args);
        spec.timeout = timeout;
        Ok(spec)
    }
}

fn builtin_tools() -> Vec<ToolSpec> {
    use ToolCategory::*;
    let mut tools = vec![
        ToolSpec::builtin("strings", Reverse, "strings", &["-a", "{file}"], "Printable strings in a binary"),
        ToolSpec::builtin("file-type", Forensics, "file", &["-b", "{file}"], "Identify a file by its magic bytes"),
        ToolSpec::builtin("binwalk", Forensics, "binwalk", &["{file}"], "Scan firmware for embedded files"),
        ToolSpec::builtin("tshark-summary", Forensics, "tshark", &["-r", "{file}", "-q", "-z", "io,phs"], "Protocol hierarchy of a capture"),
        ToolSpec::builtin("exiftool", Media, "exiftool", &["{file}"], "Read file metadata"),
        ToolSpec::builtin("zsteg", Media, "zsteg", &["-a", "{file}"], "PNG/BMP steganography checks"),
        ToolSpec::builtin("zbarimg", Media, "zbarimg", &["--raw", "{file}"], "Decode QR codes and barcodes"),
        ToolSpec::builtin("ffprobe", Media, "ffprobe", &["-hide_banner", "{file}"], "Audio/video stream info"),
        ToolSpec::builtin("rizin-info", Reverse, "rizin", &["-q", "-c", "iI", "{file}"], "Binary info via rizin"),
        ToolSpec::builtin("readelf", Reverse, "readelf", &["-h", "-l", "{file}"], "ELF header and segments"),
        ToolSpec::builtin("objdump", Reverse, "objdump", &["-d", "{file}"], "Disassemble a binary"),
        ToolSpec::builtin("ropgadget", Reverse, "ROPgadget", &["--binary", "{file}"], "Find ROP gadgets"),
        ToolSpec::builtin("john", Crypto, "john", &["--wordlist={wordlist}", "{hashes}"], "John the Ripper wordlist attack"),
        ToolSpec::builtin("hashcat", Crypto, "hashcat", &["-m", "{mode}", "-a", "0", "{hashes}", "{wordlist}"], "hashcat straight attack"),
    ];
    let mut nmap = ToolSpec::builtin("nmap", Network, "nmap", &["-sV", "{target}"], "Service scan of a target");
    nmap.network = true;
    tools.push(nmap);
    tools
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolSpec>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self { tools }
    }

    /// Built-in tools overlaid with `extra` (same name replaces), with
    /// network tools dropped unless `allow_network` is set.
    pub fn with_builtins(extra: &[ToolSpec], allow_network: bool) -> Self {
        let mut tools = builtin_tools();
        for tool in extra {
            match tools.iter_mut().find(|t| t.name == tool.name) {
                Some(existing) => *existing = tool.clone(),
                None => tools.push(tool.clone()),
            }
        }
        if !allow_network {
            tools.retain(|t| !t.network);
        }
        Self { tools }
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Result<&ToolSpec, CatalogError> {
        self.tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| CatalogError::UnknownTool {
                name: name.to_string(),
            })
    }

    pub fn categories(&self) -> Vec<ToolCategory> {
        let mut categories: Vec<ToolCategory> =
            self.tools.iter().map(|t| t.category.clone()).collect();
        categories.sort();
        categories.dedup();
        categories
    }

    pub fn by_category(&self) -> BTreeMap<ToolCategory, Vec<&ToolSpec>> {
        let mut grouped: BTreeMap<ToolCategory, Vec<&ToolSpec>> = BTreeMap::new();
        for tool in &self.tools {
            grouped.entry(tool.category.clone()).or_default().push(tool);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_placeholders_in_order_without_duplicates() {
        let tool = ToolSpec::builtin(
            "t",
            ToolCategory::Misc,
            "x",
            &["{a}", "--b={b}", "{a}"],
            "",
        );
        assert_eq!(tool.placeholders(), vec!["a", "b"]);
    }

    #[test]
    fn test_placeholder_names_may_carry_digits() {
        let tool = ToolSpec::builtin(
            "diff",
            ToolCategory::Misc,
            "cmp",
            &["{file1}", "{file_2}", "{2bad}", "{Upper}"],
            "",
        );
        assert_eq!(tool.placeholders(), vec!["file1", "file_2"]);
        let cmd = tool
            .command_line(&params(&[("file1", "a.bin"), ("file_2", "b.bin")]))
            .unwrap();
        assert_eq!(cmd.args, vec!["a.bin", "b.bin", "{2bad}", "{Upper}"]);
    }

    #[test]
    fn test_command_line_keeps_values_in_one_slot() {
        let catalog = ToolCatalog::with_builtins(&[], false);
        let john = catalog.find("john").unwrap();
        let cmd = john
            .command_line(&params(&[
                ("wordlist", "/tmp/rock you.txt"),
                ("hashes", "hashes; rm -rf /"),
            ]))
            .unwrap();
        assert_eq!(cmd.program, "john");
        assert_eq!(
            cmd.args,
            vec!["--wordlist=/tmp/rock you.txt", "hashes; rm -rf /"]
        );
    }

    #[test]
    fn test_missing_param_is_reported() {
        let catalog = ToolCatalog::with_builtins(&[], false);
        let err = catalog
            .find("hashcat")
            .unwrap()
            .command_line(&params(&[("mode", "0"), ("hashes", "h.txt")]))
            .unwrap_err();
        assert_eq!(
            err,
            CatalogError::MissingParam {
                tool: "hashcat".to_string(),
                param: "wordlist".to_string()
            }
        );
    }

    #[test]
    fn test_network_tools_need_consent() {
        let offline = ToolCatalog::with_builtins(&[], false);
        assert!(matches!(
            offline.find("nmap"),
            Err(CatalogError::UnknownTool { .. })
        ));
        let online = ToolCatalog::with_builtins(&[], true);
        assert!(online.find("nmap").unwrap().network);
    }

    #[test]
    fn test_config_tools_override_and_extend() {
        let custom = vec![
            ToolSpec::builtin("strings", ToolCategory::Reverse, "strings", &["-n", "8", "{file}"], "longer"),
            ToolSpec::builtin("steghide-info", ToolCategory::Media, "steghide", &["info", "{file}"], ""),
        ];
        let catalog = ToolCatalog::with_builtins(&custom, false);
        assert_eq!(catalog.find("strings").unwrap().args, vec!["-n", "8", "{file}"]);
        assert!(catalog.find("steghide-info").is_ok());
        assert_eq!(
            catalog.tools().iter().filter(|t| t.name == "strings").count(),
            1
        );
    }

    #[test]
    fn test_categories_and_grouping() {
        let catalog = ToolCatalog::with_builtins(&[], false);
        let categories = catalog.categories();
        assert!(categories.contains(&ToolCategory::Crypto));
        assert!(!categories.contains(&ToolCategory::Network));
        let grouped = catalog.by_category();
        assert!(grouped[&ToolCategory::Media]
            .iter()
            .any(|t| t.name == "exiftool"));
    }

    #[test]
    fn test_job_carries_category_and_timeout() {
        let tool = ToolSpec::builtin("echo", ToolCategory::Misc, "echo", &["{msg}"], "");
        assert!(tool.is_available());
        let spec = tool
            .job("echo-1", &params(&[("msg", "hi")]), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(spec.name, "echo-1");
        assert_eq!(spec.category, ToolCategory::Misc);
        assert_eq!(spec.command.args, vec!["hi"]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let tool = ToolSpec::builtin("nope", ToolCategory::Misc, "ctf-no-such-tool-xyz", &[], "");
        assert!(!tool.is_available());
    }
}
