//! Transformation of raw sitting reports into structured documents.
//!
//! A report is organized in sections (`Section`), optionally split into sub-sections
//! (`SousSection1`, `SousSection2`), each containing paragraphs (`Para`). Every paragraph with an
//! `idsyceron` identifier becomes a [`Document`], carrying the metadata of the sitting and the
//! titles of its section and sub-section. Long interventions are sometimes split over several
//! consecutive paragraphs with the same identifier; these are merged back into one document.

use anyhow::{Context, Error};
use chrono::{DateTime, Local};
use regex::Regex;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub mod archive;
mod document;
pub mod xml;

pub use archive::{read_cri_xml, CriXml};
pub use document::{parse_date, Document, Fonction, Metadata, SummaryRecord, Vote};
pub use xml::Element;

/// Turns `.taz` archives into documents, saving a summary of each sitting as JSON.
#[derive(Clone, Debug)]
pub struct Transformer {
    output_dir: PathBuf,
}

impl Transformer {
    /// Create a transformer saving per-sitting summaries under `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Extract all the documents from the archive at `path`.
    ///
    /// The documents are also summarized in `<output_dir>/<year>/<date>.json`. If `append` is set
    /// and that file already exists, the new summaries are added to the existing ones; otherwise
    /// the file is overwritten.
    ///
    /// An archive which does not contain a sitting report yields no documents.
    pub fn process_taz_file(&self, path: &Path, append: bool) -> Result<Vec<Document>, Error> {
        tracing::info!("opening {}", path.display());
        let Some(report) = read_cri_xml(path)? else {
            tracing::warn!("no sitting report in {}", path.display());
            return Ok(vec![]);
        };
        let root = xml::parse(&report.bytes)
            .with_context(|| format!("unable to parse {} in {}", report.name, path.display()))?;
        let metadata = extract_metadata(&root);
        let documents = extract_sections(&root, &metadata, Local::now());

        let summary = self.summary_path(path, &metadata);
        let total = write_summary(&summary, &documents, append)?;
        tracing::info!(
            "{} new documents added ({total} in total) to {}",
            documents.len(),
            summary.display()
        );

        Ok(documents)
    }

    /// Extract the documents from every archive directly inside `dir`.
    ///
    /// Archives which cannot be processed are logged and skipped.
    pub fn process_directory(&self, dir: &Path, append: bool) -> Result<Vec<Document>, Error> {
        let files = list_taz_files(dir)?;
        if files.is_empty() {
            tracing::warn!("no .taz files in {}", dir.display());
            return Ok(vec![]);
        }
        tracing::info!("processing {} archives", files.len());

        let mut documents = vec![];
        for (i, file) in files.iter().enumerate() {
            tracing::info!("[{}/{}] {}", i + 1, files.len(), file.display());
            match self.process_taz_file(file, append) {
                Ok(docs) => documents.extend(docs),
                Err(err) => tracing::error!("unable to process {}: {err:#}", file.display()),
            }
        }
        tracing::info!("{} documents extracted from {}", documents.len(), dir.display());
        Ok(documents)
    }

    fn summary_path(&self, archive: &Path, metadata: &Metadata) -> PathBuf {
        let year = metadata
            .annee
            .map(|year| year.to_string())
            .unwrap_or_else(|| "unknown".into());
        let name = match metadata.date_seance {
            Some(date) => date.to_string(),
            None => archive
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".into()),
        };
        self.output_dir.join(year).join(format!("{name}.json"))
    }
}

/// List the `.taz` files directly inside `dir`, sorted by name.
pub fn list_taz_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut files = vec![];
    for entry in fs::read_dir(dir).with_context(|| format!("unable to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "taz") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Extract the documents of a parsed sitting report.
pub fn transform(root: &Element, extracted_at: DateTime<Local>) -> Vec<Document> {
    let metadata = extract_metadata(root);
    extract_sections(root, &metadata, extracted_at)
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove the name of the speaker which opens the text of an intervention.
///
/// `speaker` is removed (case-insensitively, with an optional trailing period) if the text starts
/// with it. Then any remaining generic speaker designation like `M. le président.` or
/// `Mme la ministre.` is removed as well.
pub fn remove_speaker_prefix(text: &str, speaker: Option<&str>) -> String {
    let mut text = text;
    if let Some(rest) = speaker
        .filter(|speaker| !speaker.is_empty())
        .and_then(|speaker| strip_prefix_ignore_case(text, speaker))
    {
        let rest = rest.trim_start();
        text = rest.strip_prefix('.').unwrap_or(rest).trim_start();
    }
    if let Some(m) = generic_speaker().find(text) {
        text = &text[m.end()..];
    }
    text.trim().to_string()
}

fn generic_speaker() -> &'static Regex {
    static GENERIC_SPEAKER: OnceLock<Regex> = OnceLock::new();
    GENERIC_SPEAKER.get_or_init(|| {
        Regex::new(r"^(M\.|Mme|Mlle)\.?\s+[^.]+\.\s*").expect("valid regex")
    })
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let mut chars = text.char_indices();
    for expected in prefix.chars() {
        let (_, actual) = chars.next()?;
        if !actual.to_lowercase().eq(expected.to_lowercase()) {
            return None;
        }
    }
    let end = chars.next().map_or(text.len(), |(i, _)| i);
    Some(&text[end..])
}

/// Extract the sitting metadata from the first `Metadonnees` element.
pub fn extract_metadata(root: &Element) -> Metadata {
    let mut metadata = Metadata::default();
    let Some(meta) = root.descendant("Metadonnees") else {
        tracing::warn!("sitting report has no metadata");
        return metadata;
    };

    let text = |name: &str| meta.child(name).map(|elem| elem.text.trim().to_string());
    let number = |name: &str| -> Option<u32> {
        let value = text(name)?;
        match value.parse() {
            Ok(n) => Some(n),
            Err(err) => {
                tracing::warn!("invalid {name} {value:?}: {err}");
                None
            }
        }
    };

    metadata.publication_numero = number("PublicationNumero");
    metadata.date_parution = text("DateParution").and_then(|date| parse_date(&date));
    if let Some(date) = text("DateSeance").and_then(|date| parse_date(&date)) {
        metadata.set_date_seance(date);
    }
    metadata.session_nom = text("SessionNom");
    metadata.session_parlementaire = text("SessionParlementaire");
    metadata.legislature = number("LegislatureNumero");
    metadata.numero_premiere_page = number("NumeroPremierePage");
    metadata
}

/// Identify the speaker of a paragraph.
pub fn extract_speaker(para: &Element) -> (Option<String>, Option<Fonction>) {
    let name = para
        .descendant("Orateur")
        .and_then(|orateur| orateur.child("Nom"))
        .map(|nom| clean_text(&nom.text_content()))
        .filter(|name| !name.is_empty());
    let fonction = name.as_deref().map(Fonction::of_speaker);
    (name, fonction)
}

/// Extract the result of the first vote held in `section`, if any.
pub fn extract_vote(section: &Element) -> Option<Vote> {
    let result = section.descendant("ResultatVote")?;
    let count = |name: &str| {
        result
            .descendants(name)
            .into_iter()
            .find_map(|elem| elem.child("Valeur"))
            .and_then(|valeur| valeur.text.trim().parse().ok())
    };
    Some(Vote {
        nombre_votants: count("NombreVotants"),
        nombre_suffrages_exprimes: count("NombreSuffrageExprime"),
        votes_pour: count("Pour"),
        votes_contre: count("Contre"),
    })
}

/// What all paragraphs of a section or sub-section share.
#[derive(Clone)]
struct Scope<'a> {
    metadata: &'a Metadata,
    extracted_at: DateTime<Local>,
    section_id: Option<String>,
    section_titre: Option<String>,
    sous_section_titre: Option<String>,
    vote: Option<Vote>,
}

/// Extract a document for each intervention in every section of the report.
pub fn extract_sections(
    root: &Element,
    metadata: &Metadata,
    extracted_at: DateTime<Local>,
) -> Vec<Document> {
    let mut documents = vec![];
    for section in root.descendants("Section") {
        let mut context = Scope {
            metadata,
            extracted_at,
            section_id: None,
            section_titre: None,
            sous_section_titre: None,
            vote: extract_vote(section),
        };
        if let Some(titre) = section.child("TitreStruct") {
            context.section_id = Some(titre.attr("Ident").unwrap_or_default().to_string());
            context.section_titre = title(titre);
        }

        let sub_sections = section
            .children("SousSection1")
            .chain(section.children("SousSection2"))
            .collect::<Vec<_>>();
        let before = documents.len();
        if sub_sections.is_empty() {
            extract_paragraphs(section, &context, &mut documents);
        } else {
            for sub_section in sub_sections {
                let mut context = context.clone();
                if let Some(titre) = sub_section.child("TitreStruct") {
                    context.sous_section_titre = title(titre);
                }
                extract_paragraphs(sub_section, &context, &mut documents);
            }
        }
        tracing::debug!(
            section = context.section_id.as_deref().unwrap_or_default(),
            "extracted {} paragraphs",
            documents.len() - before
        );
    }
    documents
}

fn title(titre: &Element) -> Option<String> {
    titre
        .descendant("Intitule")
        .map(|intitule| clean_text(&intitule.text_content()))
}

/// Extract the paragraphs directly inside `parent`.
fn extract_paragraphs(parent: &Element, context: &Scope, documents: &mut Vec<Document>) {
    // Continuations are only merged within the same parent.
    let first = documents.len();
    for para in parent.children("Para") {
        let Some(para_id) = para.attr("idsyceron") else {
            continue;
        };
        let raw = clean_text(&para.text_content());

        if documents.len() > first {
            if let Some(last) = documents.last_mut().filter(|last| last.para_id == para_id) {
                let text = remove_speaker_prefix(&raw, last.orateur_nom.as_deref());
                if !text.is_empty() {
                    last.texte.push(' ');
                    last.texte.push_str(&text);
                }
                continue;
            }
        }

        let (orateur_nom, orateur_fonction) = extract_speaker(para);
        let texte = remove_speaker_prefix(&raw, orateur_nom.as_deref());
        documents.push(Document {
            metadata: context.metadata.clone(),
            section_id: context.section_id.clone(),
            section_titre: context.section_titre.clone(),
            sous_section_titre: context.sous_section_titre.clone(),
            para_id: para_id.to_string(),
            orateur_nom,
            orateur_fonction,
            extraction_timestamp: context.extracted_at,
            vote_present: context.vote.is_some(),
            vote: context.vote.clone(),
            texte,
        });
    }
}

/// Save the summaries of `documents` to `path`, returning the total number of records in the file.
fn write_summary(path: &Path, documents: &[Document], append: bool) -> Result<usize, Error> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("unable to create {}", dir.display()))?;
    }

    let mut records = if append && path.exists() {
        match read_summary(path) {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!("unable to read existing file {}: {err:#}", path.display());
                vec![]
            }
        }
    } else {
        vec![]
    };
    for doc in documents {
        records.push(serde_json::to_value(SummaryRecord::from(doc))?);
    }

    let file = File::create(path).with_context(|| format!("unable to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &records)?;
    Ok(records.len())
}

fn read_summary(path: &Path) -> Result<Vec<Value>, Error> {
    let file = File::open(path)?;
    match serde_json::from_reader::<_, Value>(BufReader::new(file))? {
        Value::Array(records) => Ok(records),
        _ => Err(Error::msg("expected a JSON array")),
    }
}
