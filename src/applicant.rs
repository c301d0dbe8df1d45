//! Applicant records.
//!
//! Raw rows carry the booking site's own column names. Every value is
//! normalized before it reaches the coordinator, so two rows describing the
//! same person end up with the same [`IdentityKey`].

use crate::error::ApplicantError;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

const BIRTH_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d-%m-%Y", "%d/%m/%Y", "%Y/%m/%d", "%Y.%m.%d"];

/// One roster row as found in the input file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawApplicant {
    #[serde(rename = "Nume Pasaport")]
    pub surname: String,
    #[serde(rename = "Prenume Pasaport")]
    pub given_name: String,
    #[serde(rename = "Data nasterii")]
    pub birth_date: String,
    #[serde(rename = "Locul naşterii")]
    pub birthplace: String,
    #[serde(rename = "Prenume Mama")]
    pub mother_name: String,
    #[serde(rename = "Prenume Tata")]
    pub father_name: String,
    #[serde(rename = "Adresa de email")]
    pub email: String,
    #[serde(rename = "Serie și număr Pașaport")]
    pub passport_number: String,
}

/// A normalized applicant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Applicant {
    pub surname: String,
    pub given_name: String,
    pub birth_date: NaiveDate,
    pub birthplace: String,
    pub mother_name: String,
    pub father_name: String,
    pub email: String,
    pub passport_number: String,
}

/// Deduplication and cross-process lock key: surname, given name, email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdentityKey {
    fn from(key: String) -> Self {
        IdentityKey(key)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Applicant {
    /// Normalize a raw row.
    pub fn normalize(raw: RawApplicant) -> Result<Self, ApplicantError> {
        let birth_date_text = clean(&raw.birth_date, "Data nasterii")?;
        let birth_date = parse_birth_date(&birth_date_text)?;

        Ok(Applicant {
            surname: clean(&raw.surname, "Nume Pasaport")?.to_uppercase(),
            given_name: clean(&raw.given_name, "Prenume Pasaport")?.to_uppercase(),
            birth_date,
            birthplace: clean(&raw.birthplace, "Locul naşterii")?,
            mother_name: clean(&raw.mother_name, "Prenume Mama")?,
            father_name: clean(&raw.father_name, "Prenume Tata")?,
            email: clean(&raw.email, "Adresa de email")?.to_lowercase(),
            passport_number: clean(&raw.passport_number, "Serie și număr Pașaport")?,
        })
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey(format!("{} {} {}", self.surname, self.given_name, self.email))
    }

    /// `GIVEN SURNAME`, for logs.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.given_name, self.surname)
    }

    /// `GIVEN_SURNAME` restricted to filename-safe characters.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.given_name, self.surname)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
            .collect()
    }

    /// Registration form payload, in the field names the site expects.
    pub fn form_fields(&self, date: NaiveDate, form_type: u32, captcha_token: &str) -> Vec<(&'static str, String)> {
        vec![
            ("tip_formular", form_type.to_string()),
            ("nume_pasaport", self.surname.clone()),
            ("data_nasterii", self.birth_date.format("%Y-%m-%d").to_string()),
            ("prenume_pasaport", self.given_name.clone()),
            ("locul_nasterii", self.birthplace.clone()),
            ("prenume_mama", self.mother_name.clone()),
            ("prenume_tata", self.father_name.clone()),
            ("email", self.email.clone()),
            ("numar_pasaport", self.passport_number.clone()),
            ("data_programarii", date.format("%Y-%m-%d").to_string()),
            ("gdpr", "1".to_string()),
            ("honeypot", String::new()),
            ("g-recaptcha-response", captcha_token.to_string()),
        ]
    }
}

/// Strip a `label:` prefix, transliterate and pad short values to three
/// characters by repeating the last one (the site rejects shorter values).
fn clean(value: &str, field: &'static str) -> Result<String, ApplicantError> {
    let value = value.rsplit(':').next().unwrap_or_default().trim();
    let mut value = transliterate(value);
    let Some(last) = value.chars().last() else {
        return Err(ApplicantError::MissingField(field));
    };
    while value.chars().count() < 3 {
        value.push(last);
    }
    Ok(value)
}

fn parse_birth_date(value: &str) -> Result<NaiveDate, ApplicantError> {
    BIRTH_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .ok_or_else(|| ApplicantError::BirthDate(value.to_string()))
}

/// Turkish letters to their ASCII look-alikes.
pub fn transliterate(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'Ş' => 'S',
            'ş' => 's',
            'İ' => 'I',
            'ı' => 'i',
            'Ğ' => 'G',
            'ğ' => 'g',
            'Ç' => 'C',
            'ç' => 'c',
            'Ö' => 'O',
            'ö' => 'o',
            'Ü' => 'U',
            'ü' => 'u',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawApplicant {
        RawApplicant {
            surname: "Yılmaz".into(),
            given_name: "Ayşe".into(),
            birth_date: "Doğum tarihi:09.09.1976".into(),
            birthplace: "İzmir".into(),
            mother_name: "Fatma".into(),
            father_name: "Al".into(),
            email: "Ayse.Yilmaz@Example.COM ".into(),
            passport_number: "U12345678".into(),
        }
    }

    #[test]
    fn normalizes_case_dates_and_letters() {
        let applicant = Applicant::normalize(raw()).unwrap();
        assert_eq!(applicant.surname, "YILMAZ");
        assert_eq!(applicant.given_name, "AYSE");
        assert_eq!(applicant.birth_date, NaiveDate::from_ymd_opt(1976, 9, 9).unwrap());
        assert_eq!(applicant.birthplace, "Izmir");
        assert_eq!(applicant.father_name, "All");
        assert_eq!(applicant.email, "ayse.yilmaz@example.com");
        assert_eq!(applicant.identity().as_str(), "YILMAZ AYSE ayse.yilmaz@example.com");
        assert_eq!(applicant.file_stem(), "AYSE_YILMAZ");
    }

    #[test]
    fn same_person_same_identity() {
        let mut other = raw();
        other.surname = "YILMAZ".into();
        other.email = "ayse.yilmaz@example.com".into();
        other.birth_date = "1976-09-09".into();
        assert_eq!(
            Applicant::normalize(raw()).unwrap().identity(),
            Applicant::normalize(other).unwrap().identity()
        );
    }

    #[test]
    fn rejects_empty_fields_and_bad_dates() {
        let mut missing = raw();
        missing.email = "  ".into();
        assert_eq!(
            Applicant::normalize(missing).unwrap_err(),
            ApplicantError::MissingField("Adresa de email")
        );

        let mut bad_date = raw();
        bad_date.birth_date = "sometime".into();
        assert_eq!(
            Applicant::normalize(bad_date).unwrap_err(),
            ApplicantError::BirthDate("sometime".into())
        );
    }

    #[test]
    fn form_payload_uses_site_field_names() {
        let applicant = Applicant::normalize(raw()).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 2, 19).unwrap();
        let fields = applicant.form_fields(date, 4, "tok");
        let get = |name: &str| fields.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str());

        assert_eq!(get("tip_formular"), Some("4"));
        assert_eq!(get("data_nasterii"), Some("1976-09-09"));
        assert_eq!(get("data_programarii"), Some("2025-02-19"));
        assert_eq!(get("g-recaptcha-response"), Some("tok"));
        assert_eq!(get("honeypot"), Some(""));
    }
}
