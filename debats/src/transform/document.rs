//! Structured documents extracted from sitting reports.

use chrono::{DateTime, Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Information about a sitting, shared by every intervention in it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication_numero: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_parution: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_seance: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annee: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mois: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_nom: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_parlementaire: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legislature: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numero_premiere_page: Option<u32>,
}

impl Metadata {
    /// Set the date of the sitting, along with the year and month derived from it.
    pub fn set_date_seance(&mut self, date: NaiveDate) {
        self.date_seance = Some(date);
        self.annee = Some(date.year());
        self.mois = Some(date.month());
    }
}

/// The role of a speaker, as far as it can be told from the way they are named.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Fonction {
    #[strum(serialize = "Président")]
    #[serde(rename = "Président")]
    President,
    Ministre,
    #[strum(serialize = "Secrétaire")]
    #[serde(rename = "Secrétaire")]
    Secretaire,
    #[strum(serialize = "Député")]
    #[serde(rename = "Député")]
    Depute,
}

impl Fonction {
    /// Deduce the role of a speaker from their name (e.g. "M. le président").
    pub fn of_speaker(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("président") {
            Self::President
        } else if name.contains("ministre") {
            Self::Ministre
        } else if name.contains("secrétaire") {
            Self::Secretaire
        } else {
            Self::Depute
        }
    }
}

/// The result of a vote held during a section of the debate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Vote {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nombre_votants: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nombre_suffrages_exprimes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes_pour: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes_contre: Option<u32>,
}

/// A single intervention in a debate, as indexed for search.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Document {
    #[serde(flatten)]
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_titre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sous_section_titre: Option<String>,
    /// The `idsyceron` identifier of the paragraph, unique across the corpus.
    pub para_id: String,
    pub orateur_nom: Option<String>,
    pub orateur_fonction: Option<Fonction>,
    pub extraction_timestamp: DateTime<Local>,
    pub vote_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote: Option<Vote>,
    pub texte: String,
}

/// The condensed form of a [`Document`] saved to the per-sitting JSON files.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SummaryRecord {
    pub fonction: String,
    pub para_id: String,
    pub orateur_nom: String,
    pub texte: String,
    pub section_titre: String,
    pub sous_section_titre: String,
    pub section_id: String,
}

const NOT_AVAILABLE: &str = "N/A";

impl From<&Document> for SummaryRecord {
    fn from(doc: &Document) -> Self {
        let or_na = |field: &Option<String>| {
            field.clone().unwrap_or_else(|| NOT_AVAILABLE.into())
        };
        Self {
            fonction: doc
                .orateur_fonction
                .map(|fonction| fonction.to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.into()),
            para_id: doc.para_id.clone(),
            orateur_nom: or_na(&doc.orateur_nom),
            texte: doc.texte.clone(),
            section_titre: or_na(&doc.section_titre),
            sous_section_titre: or_na(&doc.sous_section_titre),
            section_id: or_na(&doc.section_id),
        }
    }
}

/// Parse a date as written in sitting reports, like `Mercredi-22-05-Mai-2013`.
///
/// The day and month are the second and third dash-separated parts, and the year is the last.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let parts = s.trim().split('-').collect::<Vec<_>>();
    if parts.len() < 3 {
        return None;
    }
    let day = parts[1].trim().parse().ok()?;
    let month = parts[2].trim().parse().ok()?;
    let year = parts[parts.len() - 1].trim().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("Mercredi-22-05-Mai-2013"),
            NaiveDate::from_ymd_opt(2013, 5, 22)
        );
        assert_eq!(
            parse_date("Lundi-3-1-Janvier-2022"),
            NaiveDate::from_ymd_opt(2022, 1, 3)
        );
        assert_eq!(parse_date("22 mai 2013"), None);
        assert_eq!(parse_date("Jeudi-31-02-Février-2022"), None);
        assert_eq!(parse_date("Jeudi-xx-02-Février-2022"), None);
    }

    #[test]
    fn test_fonction() {
        assert_eq!(Fonction::of_speaker("M. le président"), Fonction::President);
        assert_eq!(Fonction::of_speaker("Mme la Présidente"), Fonction::President);
        assert_eq!(
            Fonction::of_speaker("M. Olivier Véran, ministre des solidarités et de la santé"),
            Fonction::Ministre
        );
        assert_eq!(
            Fonction::of_speaker("Mme la secrétaire d'État"),
            Fonction::Secretaire
        );
        assert_eq!(Fonction::of_speaker("M. Thomas Mesnier"), Fonction::Depute);
        assert_eq!(Fonction::Depute.to_string(), "Député");
        assert_eq!(
            serde_json::to_value(Fonction::President).unwrap(),
            json!("Président")
        );
    }

    #[test]
    fn test_metadata_serialization() {
        let mut metadata = Metadata {
            publication_numero: Some(2),
            ..Default::default()
        };
        metadata.set_date_seance(NaiveDate::from_ymd_opt(2022, 1, 4).unwrap());
        assert_eq!(
            serde_json::to_value(&metadata).unwrap(),
            json!({
                "publication_numero": 2,
                "date_seance": "2022-01-04",
                "annee": 2022,
                "mois": 1,
            })
        );
    }

    #[test]
    fn test_summary_record() {
        let doc = Document {
            metadata: Default::default(),
            section_id: Some("S1".into()),
            section_titre: Some("Questions au Gouvernement".into()),
            sous_section_titre: None,
            para_id: "123".into(),
            orateur_nom: None,
            orateur_fonction: None,
            extraction_timestamp: Local::now(),
            vote_present: false,
            vote: None,
            texte: "La séance est ouverte.".into(),
        };
        assert_eq!(
            SummaryRecord::from(&doc),
            SummaryRecord {
                fonction: "N/A".into(),
                para_id: "123".into(),
                orateur_nom: "N/A".into(),
                texte: "La séance est ouverte.".into(),
                section_titre: "Questions au Gouvernement".into(),
                sous_section_titre: "N/A".into(),
                section_id: "S1".into(),
            }
        );
    }
}
