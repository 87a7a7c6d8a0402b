use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

pub const MIN_YEAR_LEVEL: i64 = 1;
pub const MAX_YEAR_LEVEL: i64 = 6;

#[derive(Debug, Error, PartialEq)]
pub enum RosterError {
    #[error("roster file is empty")]
    Empty,
    #[error("roster header is missing required column: {0}")]
    MissingColumn(&'static str),
}

impl RosterError {
    pub fn code(&self) -> &'static str {
        "parse_failed"
    }
}

/// Split one CSV record. Commas inside double quotes do not split and `""`
/// inside quotes is a literal quote.
pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn is_valid_email(s: &str) -> bool {
    let t = s.trim();
    if t.chars().any(char::is_whitespace) {
        return false;
    }
    match t.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

/// `BSIT-2A`, `BSCS 3B`, `BSED1C`: program letters, year digit, section
/// suffix letters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionCode {
    pub program: String,
    pub year: i64,
    pub suffix: String,
}

impl SectionCode {
    pub fn short_name(&self) -> String {
        format!("{}{}", self.year, self.suffix)
    }

    pub fn canonical(&self) -> String {
        format!("{}-{}{}", self.program, self.year, self.suffix)
    }
}

pub fn parse_section_code(raw: &str) -> Option<SectionCode> {
    let t = raw.trim().to_ascii_uppercase();
    let program: String = t.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if program.len() < 2 {
        return None;
    }
    let rest = t[program.len()..].trim_start_matches(['-', ' ', '_']);
    let mut chars = rest.chars();
    let year = chars.next()?.to_digit(10)? as i64;
    if !(MIN_YEAR_LEVEL..=MAX_YEAR_LEVEL).contains(&year) {
        return None;
    }
    let suffix: String = chars.collect();
    if suffix.is_empty() || suffix.len() > 3 || !suffix.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(SectionCode {
        program,
        year,
        suffix,
    })
}

#[derive(Debug, Clone)]
pub struct SectionRef {
    pub id: String,
    pub name: String,
    pub program: String,
    pub year_level: i64,
    pub course_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CourseRef {
    pub id: String,
    pub code: String,
}

/// Exact section name first, then the program/year/suffix pattern.
pub fn resolve_section<'a>(raw: &str, sections: &'a [SectionRef]) -> Option<&'a SectionRef> {
    let wanted = raw.trim();
    if wanted.is_empty() {
        return None;
    }
    let exact: Vec<&SectionRef> = sections
        .iter()
        .filter(|s| s.name.trim().eq_ignore_ascii_case(wanted))
        .collect();
    if exact.len() == 1 {
        return exact.first().copied();
    }

    let code = parse_section_code(wanted)?;
    let short = code.short_name();
    let canonical = code.canonical();
    let candidates: Vec<&SectionRef> = sections
        .iter()
        .filter(|s| s.program.trim().eq_ignore_ascii_case(&code.program))
        .filter(|s| s.year_level == code.year)
        .filter(|s| {
            let n = s.name.trim();
            n.eq_ignore_ascii_case(&short)
                || n.eq_ignore_ascii_case(&canonical)
                || n.eq_ignore_ascii_case(wanted)
        })
        .collect();
    if candidates.len() == 1 {
        candidates.first().copied()
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RosterOptions {
    pub allow_unknown_section: bool,
    pub require_email: bool,
    pub default_year_level: i64,
}

impl Default for RosterOptions {
    fn default() -> Self {
        Self {
            allow_unknown_section: false,
            require_email: true,
            default_year_level: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterRow {
    pub line_no: usize,
    pub id: Option<String>,
    pub name: String,
    pub email: String,
    pub year_level: Option<String>,
    pub section: Option<String>,
    pub course: Option<String>,
}

fn non_empty_trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn find_column(idx: &HashMap<String, usize>, aliases: &[&str]) -> Option<usize> {
    aliases.iter().find_map(|a| idx.get(*a).copied())
}

/// Physical lines joined into CSV records, each with its first line number.
/// A quoted field may span line breaks; an unterminated quote runs to the end.
fn csv_records(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    for (i, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        match pending.as_mut() {
            Some((_, buf)) => {
                buf.push('\n');
                buf.push_str(line);
            }
            None if line.trim().is_empty() => continue,
            None => pending = Some((i + 1, line.to_string())),
        }
        let closed = pending
            .as_ref()
            .is_some_and(|(_, buf)| buf.matches('"').count() % 2 == 0);
        if closed {
            out.extend(pending.take());
        }
    }
    out.extend(pending);
    out
}

/// Returns the data rows and the number of non-blank data records seen.
pub fn parse_roster_rows(text: &str) -> Result<(Vec<RosterRow>, usize), RosterError> {
    let text = text.trim_start_matches('\u{feff}');
    let mut records = csv_records(text).into_iter();
    let Some((_, header)) = records.next() else {
        return Err(RosterError::Empty);
    };

    let mut idx = HashMap::<String, usize>::new();
    for (i, f) in parse_csv_record(&header).into_iter().enumerate() {
        idx.entry(f.trim().to_ascii_lowercase()).or_insert(i);
    }
    let name_col =
        find_column(&idx, &["name", "full_name", "student_name"]).ok_or(RosterError::MissingColumn("name"))?;
    let id_col = find_column(&idx, &["id", "student_id", "student_no"]);
    let email_col = find_column(&idx, &["email", "email_address"]);
    let year_col = find_column(&idx, &["year_level", "year"]);
    let section_col = find_column(&idx, &["section", "section_code", "section_name"]);
    let course_col = find_column(&idx, &["course", "course_code"]);

    let field = |fields: &[String], col: Option<usize>| -> Option<String> {
        col.and_then(|c| fields.get(c)).and_then(|s| non_empty_trimmed(s))
    };

    let mut rows = Vec::new();
    let mut total = 0usize;
    for (line_no, record) in records {
        total += 1;
        let fields = parse_csv_record(&record);
        rows.push(RosterRow {
            line_no,
            id: field(&fields, id_col),
            name: field(&fields, Some(name_col)).unwrap_or_default(),
            email: field(&fields, email_col).unwrap_or_default(),
            year_level: field(&fields, year_col),
            section: field(&fields, section_col),
            course: field(&fields, course_col),
        });
    }
    Ok((rows, total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    New,
    DuplicateExisting,
    DuplicateInFile,
    Invalid,
    UnknownSection,
}

impl RowOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::DuplicateExisting => "duplicate_existing",
            Self::DuplicateInFile => "duplicate_in_file",
            Self::Invalid => "invalid",
            Self::UnknownSection => "unknown_section",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedStudent {
    pub line_no: usize,
    pub id: String,
    pub name: String,
    pub email: String,
    pub year_level: i64,
    pub section_id: Option<String>,
    pub course_id: Option<String>,
    pub outcome: RowOutcome,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportPlan {
    pub rows: Vec<PlannedStudent>,
}

impl ImportPlan {
    pub fn count(&self, outcome: RowOutcome) -> usize {
        self.rows.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn to_create(&self) -> impl Iterator<Item = &PlannedStudent> {
        self.rows.iter().filter(|r| r.outcome == RowOutcome::New)
    }
}

pub fn plan_import(
    rows: &[RosterRow],
    sections: &[SectionRef],
    courses: &[CourseRef],
    existing_ids: &HashSet<String>,
    opts: RosterOptions,
) -> ImportPlan {
    let mut seen = HashSet::<String>::new();
    let mut plan = ImportPlan::default();

    for row in rows {
        let mut planned = PlannedStudent {
            line_no: row.line_no,
            id: row.id.clone().unwrap_or_default(),
            name: row.name.clone(),
            email: row.email.clone(),
            year_level: opts.default_year_level,
            section_id: None,
            course_id: None,
            outcome: RowOutcome::New,
            message: None,
        };

        if let Some(id) = row.id.as_deref() {
            if existing_ids.contains(id) {
                planned.outcome = RowOutcome::DuplicateExisting;
                planned.message = Some("student id already exists".into());
                plan.rows.push(planned);
                continue;
            }
            if !seen.insert(id.to_string()) {
                planned.outcome = RowOutcome::DuplicateInFile;
                planned.message = Some("student id repeated earlier in file".into());
                plan.rows.push(planned);
                continue;
            }
        } else {
            planned.id = Uuid::new_v4().to_string();
        }

        if let Err(msg) = fill_row(row, &mut planned, sections, courses, opts) {
            planned.outcome = if msg == UNKNOWN_SECTION {
                RowOutcome::UnknownSection
            } else {
                RowOutcome::Invalid
            };
            planned.message = Some(msg);
        }
        plan.rows.push(planned);
    }
    plan
}

const UNKNOWN_SECTION: &str = "section not found";

fn fill_row(
    row: &RosterRow,
    planned: &mut PlannedStudent,
    sections: &[SectionRef],
    courses: &[CourseRef],
    opts: RosterOptions,
) -> Result<(), String> {
    if row.name.is_empty() {
        return Err("name is required".into());
    }
    if row.email.is_empty() {
        if opts.require_email {
            return Err("email is required".into());
        }
    } else if !is_valid_email(&row.email) {
        return Err(format!("invalid email: {}", row.email));
    }

    let section = match row.section.as_deref() {
        Some(raw) => match resolve_section(raw, sections) {
            Some(s) => Some(s),
            None if opts.allow_unknown_section => {
                planned.message = Some(format!("section {} not found; imported without section", raw));
                None
            }
            None => return Err(UNKNOWN_SECTION.into()),
        },
        None => None,
    };
    planned.section_id = section.map(|s| s.id.clone());

    planned.course_id = match row.course.as_deref() {
        Some(code) => Some(
            courses
                .iter()
                .find(|c| c.code.trim().eq_ignore_ascii_case(code))
                .map(|c| c.id.clone())
                .ok_or_else(|| format!("unknown course code: {}", code))?,
        ),
        None => section.and_then(|s| s.course_id.clone()),
    };

    let code_year = row
        .section
        .as_deref()
        .and_then(parse_section_code)
        .map(|c| c.year);
    planned.year_level = match row.year_level.as_deref() {
        Some(raw) => {
            let n = raw
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("year level must be a number: {}", raw))?;
            if !(MIN_YEAR_LEVEL..=MAX_YEAR_LEVEL).contains(&n) {
                return Err(format!(
                    "year level must be in {}..={}",
                    MIN_YEAR_LEVEL, MAX_YEAR_LEVEL
                ));
            }
            n
        }
        None => code_year
            .or_else(|| section.map(|s| s.year_level))
            .unwrap_or(opts.default_year_level),
    };
    Ok(())
}
