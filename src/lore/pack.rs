use std::fs::read_dir;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};
use crate::lore::estimate_tokens;

/// `pack.yaml` at the root of a content pack directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub layer: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// YAML front matter of a pack markdown file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontMatter {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub entity_refs: Vec<String>,
    #[serde(default)]
    pub faction_refs: Vec<String>,
    #[serde(default)]
    pub location_refs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The unit of retrieval: one H2 section (or the H1 overview) of a pack
/// file, plus the metadata inherited from its front matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub pack_id: String,
    pub file_path: String,
    pub section_path: String,
    pub body: String,
    pub kind: String,
    pub entity_refs: Vec<String>,
    pub faction_refs: Vec<String>,
    pub location_refs: Vec<String>,
    pub tags: Vec<String>,
    pub token_count: usize,
}

/// Load a pack directory: manifest plus the chunk set derived from every
/// markdown file under it. Packs are immutable once installed; this runs at
/// install time only.
pub fn load_pack(dir: &Path) -> Result<(PackManifest, Vec<Chunk>)> {
    let manifest_path = dir.join("pack.yaml");
    let manifest_raw = std::fs::read_to_string(&manifest_path)
        .map_err(|_| PackError::MissingManifest(manifest_path.display().to_string()))?;
    let manifest: PackManifest = serde_yaml::from_str(&manifest_raw).map_err(|e| {
        PackError::Malformed {
            path: manifest_path.display().to_string(),
            detail: e.to_string(),
        }
    })?;

    let mut chunks = Vec::new();
    for file in markdown_files(dir) {
        let raw = std::fs::read_to_string(&file)?;
        let relative = file
            .strip_prefix(dir)
            .unwrap_or(&file)
            .to_string_lossy()
            .to_string();
        let (front, body) = split_front_matter(&raw).ok_or_else(|| PackError::Malformed {
            path: relative.clone(),
            detail: "missing YAML front matter".to_string(),
        })?;
        let front: FrontMatter =
            serde_yaml::from_str(front).map_err(|e| PackError::Malformed {
                path: relative.clone(),
                detail: e.to_string(),
            })?;
        chunks.extend(chunk_markdown(&manifest.id, &relative, &front, body));
    }
    Ok((manifest, chunks))
}

fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(markdown_files(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            files.push(path);
        }
    }
    files.sort();
    files
}

/// Split `---` fenced YAML front matter from the markdown body.
fn split_front_matter(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let front = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\n', '\r']);
    Some((front, body))
}

/// Chunk by H2 headers: the H1 and anything before the first H2 become an
/// overview chunk; each H2 opens a chunk; H3 and deeper merge into the
/// enclosing H2.
fn chunk_markdown(pack_id: &str, file_path: &str, front: &FrontMatter, body: &str) -> Vec<Chunk> {
    let mut sections: Vec<(String, Vec<&str>)> = vec![("overview".to_string(), Vec::new())];
    for line in body.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            sections.push((heading.trim().to_string(), Vec::new()));
        } else {
            sections
                .last_mut()
                .expect("sections always starts non-empty")
                .1
                .push(line);
        }
    }

    let mut chunks = Vec::new();
    for (index, (heading, lines)) in sections.into_iter().enumerate() {
        let text = lines.join("\n").trim().to_string();
        if text.is_empty() {
            continue;
        }
        let section_path = format!("{} > {}", front.title, heading);
        chunks.push(Chunk {
            id: format!("{pack_id}:{file_path}#{index}"),
            pack_id: pack_id.to_string(),
            file_path: file_path.to_string(),
            section_path,
            token_count: estimate_tokens(&text),
            body: text,
            kind: front.kind.clone(),
            entity_refs: front
                .entity_id
                .iter()
                .cloned()
                .chain(front.entity_refs.iter().cloned())
                .collect(),
            faction_refs: front.faction_refs.clone(),
            location_refs: front.location_refs.clone(),
            tags: front.tags.clone(),
        });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"---
title: The Rusted Anchor
type: location
entity_id: pack:rusted_anchor
tags: [bar, dockside]
---
# The Rusted Anchor

A dockside bar that smells of engine oil.

## Atmosphere

Low light, the hum of a broken cooler.

### Sounds

Dock cranes grinding outside.

## Regulars

Longshore crews and one off-shift fixer.
"#;

    #[test]
    fn h1_becomes_overview_and_h3_merges_upward() {
        let (front, body) = split_front_matter(FILE).unwrap();
        let front: FrontMatter = serde_yaml::from_str(front).unwrap();
        let chunks = chunk_markdown("core", "locations/rusted_anchor.md", &front, body);

        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].section_path.ends_with("overview"));
        assert!(chunks[0].body.contains("smells of engine oil"));
        assert!(chunks[1].body.contains("broken cooler"));
        // H3 content stays inside its parent H2 chunk.
        assert!(chunks[1].body.contains("Dock cranes"));
        assert!(chunks[2].section_path.ends_with("Regulars"));
    }

    #[test]
    fn front_matter_entity_id_lands_in_entity_refs() {
        let (front, body) = split_front_matter(FILE).unwrap();
        let front: FrontMatter = serde_yaml::from_str(front).unwrap();
        let chunks = chunk_markdown("core", "locations/rusted_anchor.md", &front, body);
        assert!(chunks
            .iter()
            .all(|c| c.entity_refs.contains(&"pack:rusted_anchor".to_string())));
    }

    #[test]
    fn missing_front_matter_is_detected() {
        assert!(split_front_matter("# No front matter\n").is_none());
    }
}
