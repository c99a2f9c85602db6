use super::*;

#[derive(Deserialize)]
pub struct ResctrlConfig {
    #[serde(default = "enabled")]
    enabled: bool,

    // resctrl mount point, discovered from mountinfo when unset
    #[serde(default)]
    root: Option<String>,
}

impl Default for ResctrlConfig {
    fn default() -> Self {
        Self {
            enabled: enabled(),
            root: None,
        }
    }
}

impl ResctrlConfig {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref().map(Path::new)
    }
}
