use crate::error::{OverlayError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// Bold sans faces first: overlay labels read best heavy.
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "DejaVuSans-Bold.ttf",
    "LiberationSans-Bold.ttf",
    "NotoSans-Bold.ttf",
    "arialbd.ttf",
    "Arial Bold.ttf",
    "segoeuib.ttf",
    "DejaVuSans.ttf",
    "LiberationSans-Regular.ttf",
    "NotoSans-Regular.ttf",
    "arial.ttf",
    "Arial.ttf",
    "segoeui.ttf",
    "Helvetica.ttc",
];

const MAX_FONT_DIR_DEPTH: usize = 4;

static SYSTEM_FONT: OnceLock<Mutex<Option<Option<Arc<RegisteredFont>>>>> = OnceLock::new();

#[derive(Debug)]
pub struct RegisteredFont {
    pub name: String,
    pub data: Vec<u8>,
    pub units_per_em: u16,
    pub ascender: i16,
    pub descender: i16,
}

impl RegisteredFont {
    fn from_bytes(data: Vec<u8>, source: &Path) -> Option<RegisteredFont> {
        let face = ttf_parser::Face::parse(&data, 0).ok()?;
        let name = font_name(&face, source);
        let units_per_em = face.units_per_em().max(1);
        let ascender = face.ascender();
        let descender = face.descender();
        Some(RegisteredFont {
            name,
            data,
            units_per_em,
            ascender,
            descender,
        })
    }
}

/// Fonts available to the compositor. The first registered font is the one
/// labels are drawn with; the system font is used when nothing was registered.
#[derive(Debug, Default)]
pub struct FontRegistry {
    fonts: Vec<Arc<RegisteredFont>>,
    lookup: HashMap<String, usize>,
    system_fallback: bool,
}

impl FontRegistry {
    pub fn new() -> Self {
        Self {
            fonts: Vec::new(),
            lookup: HashMap::new(),
            system_fallback: true,
        }
    }

    /// Registry that never consults system font directories.
    pub fn isolated() -> Self {
        Self {
            system_fallback: false,
            ..Self::default()
        }
    }

    pub fn register_dir(&mut self, path: impl AsRef<Path>) {
        let Ok(entries) = fs::read_dir(path.as_ref()) else {
            return;
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        for file in files {
            let _ = self.register_file(file);
        }
    }

    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|v| v.to_str())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        if !matches!(ext.as_str(), "ttf" | "otf" | "ttc") {
            return Err(OverlayError::invalid_configuration(format!(
                "not a font file: {}",
                path.display()
            )));
        }
        let data = fs::read(path)?;
        self.register_with_source(data, path)
    }

    pub fn register_bytes(&mut self, data: Vec<u8>, source_name: Option<&str>) -> Result<String> {
        let source = source_name.unwrap_or("EmbeddedFont");
        self.register_with_source(data, Path::new(source))
    }

    fn register_with_source(&mut self, data: Vec<u8>, source: &Path) -> Result<String> {
        let font = RegisteredFont::from_bytes(data, source).ok_or_else(|| {
            OverlayError::invalid_configuration(format!(
                "invalid font data for {}",
                source.display()
            ))
        })?;
        let name = font.name.clone();
        let index = self.fonts.len();
        self.fonts.push(Arc::new(font));
        let key = normalize_name(&name);
        self.lookup.entry(key).or_insert(index);
        if let Some(stem) = source.file_stem().and_then(|v| v.to_str()) {
            self.lookup.entry(normalize_name(stem)).or_insert(index);
        }
        Ok(name)
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<RegisteredFont>> {
        let key = normalize_name(name);
        self.lookup
            .get(&key)
            .and_then(|index| self.fonts.get(*index))
            .cloned()
    }

    /// The face overlays are drawn with.
    pub fn primary(&self) -> Option<Arc<RegisteredFont>> {
        if let Some(font) = self.fonts.first() {
            return Some(font.clone());
        }
        if self.system_fallback {
            return system_font();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }
}

fn system_font() -> Option<Arc<RegisteredFont>> {
    let cache = SYSTEM_FONT.get_or_init(|| Mutex::new(None));
    let Ok(mut guard) = cache.lock() else {
        return None;
    };
    if let Some(entry) = guard.as_ref() {
        return entry.clone();
    }
    let loaded = load_system_font().map(Arc::new);
    match &loaded {
        Some(font) => tracing::debug!(font = %font.name, "resolved system font"),
        None => tracing::warn!("no system font found; overlay text will be omitted"),
    }
    *guard = Some(loaded.clone());
    loaded
}

fn load_system_font() -> Option<RegisteredFont> {
    let dirs = system_font_dirs();
    for candidate in SYSTEM_FONT_CANDIDATES {
        for dir in &dirs {
            let Some(path) = find_file(dir, candidate, MAX_FONT_DIR_DEPTH) else {
                continue;
            };
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            if let Some(font) = RegisteredFont::from_bytes(bytes, &path) {
                return Some(font);
            }
        }
    }
    None
}

fn find_file(dir: &Path, file_name: &str, depth: usize) -> Option<PathBuf> {
    let direct = dir.join(file_name);
    if direct.is_file() {
        return Some(direct);
    }
    if depth == 0 {
        return None;
    }
    let mut subdirs: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subdirs.sort();
    subdirs
        .iter()
        .find_map(|sub| find_file(sub, file_name, depth - 1))
}

fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Ok(extra) = std::env::var("SETLIST_OVERLAY_FONT_DIR") {
        for path in std::env::split_paths(&extra) {
            if !path.as_os_str().is_empty() {
                dirs.push(path);
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        dirs.push(PathBuf::from(r"C:\Windows\Fonts"));
        if let Ok(windir) = std::env::var("WINDIR") {
            dirs.push(PathBuf::from(windir).join("Fonts"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        dirs.push(PathBuf::from("/usr/share/fonts"));
        dirs.push(PathBuf::from("/usr/local/share/fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join(".fonts"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/System/Library/Fonts"));
        dirs.push(PathBuf::from("/Library/Fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join("Library/Fonts"));
        }
    }

    dirs
}

fn font_name(face: &ttf_parser::Face<'_>, path: &Path) -> String {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut post = None;
    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::POST_SCRIPT_NAME if post.is_none() => post = Some(name),
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY if family.is_none() => {
                family = Some(name)
            }
            _ => {}
        }
    }
    post.or(family)
        .or_else(|| {
            path.file_stem()
                .and_then(|v| v.to_str())
                .map(|v| v.to_string())
        })
        .unwrap_or_else(|| "EmbeddedFont".to_string())
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}
