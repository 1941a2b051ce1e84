use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::convert::Infallible;
use std::fmt;

use ahash::AHashMap;
use pyo3::create_exception;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyString;
use rayon::prelude::*;
use strsim::normalized_levenshtein;
use thiserror::Error;

// Field slots inside a prepared record, in mapping order.
const PRIMARY: usize = 0;
const SECONDARY: usize = 1;
const AUX1: usize = 2;
const AUX2: usize = 3;

/// Bucket key for records whose key-source fields carry no usable content.
/// All such records collide into one shared bucket.
const UNKEYED: &str = "XXXX";

// === ERRORS ===

/// Setup failures, raised before any record is processed.
///
/// Per-record data problems (absent cells, short rows, stringified "nan")
/// never reach this type; they degrade to empty fields and zero similarity.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("column '{column}' is not present in the {side} sheet")]
    MissingColumn { side: &'static str, column: String },
    #[error("weights must be non-negative and sum to 100, got {got}")]
    BadWeights { got: f64 },
    #[error("top_n must be at least 1")]
    BadTopN,
    #[error("thresholds must satisfy 0 <= min_score <= medium_threshold <= high_threshold <= 100")]
    BadThresholds,
    #[error("block key strategy requires non-zero prefix and suffix lengths")]
    BadBlockKey,
    #[error("the {side} sheet has no rows")]
    EmptyDataset { side: &'static str },
}

create_exception!(_rust, ConfigurationError, PyValueError);
create_exception!(_rust, DataError, PyValueError);

impl From<MatchError> for PyErr {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::EmptyDataset { .. } => DataError::new_err(err.to_string()),
            _ => ConfigurationError::new_err(err.to_string()),
        }
    }
}

// === TIERS ===

/// Confidence tier attached to every emitted candidate row.
///
/// `Exact` and `Blank` are assigned by the pipeline itself; `classify`
/// only ever produces the score-derived tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Exact,
    High,
    Medium,
    Low,
    Reject,
    Blank,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Self::Exact => "EXACT",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Reject => "REJECT",
            Self::Blank => "BLANK",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl<'py> IntoPyObject<'py> for Tier {
    type Target = PyString;
    type Output = Bound<'py, PyString>;
    type Error = Infallible;

    fn into_pyobject(self, py: Python<'py>) -> Result<Self::Output, Self::Error> {
        Ok(PyString::new(py, self.label()))
    }
}

/// Map a fuzzy score to its tier. Lower bounds are inclusive.
pub fn classify(score: f64, config: &MatchConfig) -> Tier {
    if score >= config.high_threshold {
        Tier::High
    } else if score >= config.medium_threshold {
        Tier::Medium
    } else if score >= config.min_score {
        Tier::Low
    } else {
        Tier::Reject
    }
}

// === NORMALIZATION ===

/// Canonicalize one cell: trim, lowercase. Absent cells become "".
fn normalize(value: Option<&str>) -> String {
    value.map(|s| s.trim().to_lowercase()).unwrap_or_default()
}

/// A normalized value too short to compare, or a stringified missing-value
/// marker left behind by the loading layer.
fn is_blank(normalized: &str) -> bool {
    normalized.chars().count() < 2 || normalized == "nan"
}

/// Tokenize on whitespace, sort tokens alphabetically, rejoin.
fn sort_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Unique sorted whitespace tokens.
fn unique_tokens(s: &str) -> Vec<String> {
    let mut tokens: Vec<String> = s.split_whitespace().map(str::to_string).collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

// === SIMILARITY ===

/// Edit-distance ratio of two already token-sorted strings, 0-100.
fn token_sort_similarity_sorted(sorted1: &str, sorted2: &str) -> f64 {
    if sorted1.is_empty() || sorted2.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(sorted1, sorted2) * 100.0
}

/// Order-insensitive similarity of two normalized strings, 0-100.
/// "smith john" vs "john smith" scores 100.
fn token_sort_similarity(norm1: &str, norm2: &str) -> f64 {
    token_sort_similarity_sorted(&sort_tokens(norm1), &sort_tokens(norm2))
}

/// Set-based similarity over unique sorted token lists, 0-100.
///
/// Tokens common to both sides are split out first, so a string whose
/// tokens are a superset of the other's still scores 100. Tolerates
/// truncated or padded field values.
fn token_set_similarity_tokens(tokens1: &[String], tokens2: &[String]) -> f64 {
    if tokens1.is_empty() || tokens2.is_empty() {
        return 0.0;
    }

    let mut common: Vec<&str> = Vec::new();
    let mut only1: Vec<&str> = Vec::new();
    let mut only2: Vec<&str> = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < tokens1.len() && j < tokens2.len() {
        match tokens1[i].cmp(&tokens2[j]) {
            Ordering::Equal => {
                common.push(tokens1[i].as_str());
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                only1.push(tokens1[i].as_str());
                i += 1;
            }
            Ordering::Greater => {
                only2.push(tokens2[j].as_str());
                j += 1;
            }
        }
    }
    only1.extend(tokens1[i..].iter().map(String::as_str));
    only2.extend(tokens2[j..].iter().map(String::as_str));

    let sect = common.join(" ");
    let combined1 = join_sect(&sect, &only1);
    let combined2 = join_sect(&sect, &only2);

    let mut best = normalized_levenshtein(&combined1, &combined2);
    if !sect.is_empty() {
        best = best
            .max(normalized_levenshtein(&sect, &combined1))
            .max(normalized_levenshtein(&sect, &combined2));
    }
    best * 100.0
}

fn join_sect(sect: &str, rest: &[&str]) -> String {
    if rest.is_empty() {
        sect.to_string()
    } else if sect.is_empty() {
        rest.join(" ")
    } else {
        format!("{sect} {}", rest.join(" "))
    }
}

/// Set-based similarity of two normalized strings, 0-100.
fn token_set_similarity(norm1: &str, norm2: &str) -> f64 {
    token_set_similarity_tokens(&unique_tokens(norm1), &unique_tokens(norm2))
}

// === DATA MODEL ===

/// Column-oriented view of one loaded sheet. Row position is the source
/// record ordinal and is preserved through the whole pipeline.
#[derive(Debug, Clone, FromPyObject)]
pub struct Dataset {
    #[pyo3(item)]
    pub columns: Vec<String>,
    #[pyo3(item)]
    pub rows: Vec<Vec<Option<String>>>,
}

impl Dataset {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Caller-chosen assignment of role slots to column names. The same
/// mapping is applied to both sheets.
#[derive(Debug, Clone, FromPyObject)]
pub struct FieldMapping {
    #[pyo3(item)]
    pub primary: String,
    #[pyo3(item)]
    pub secondary: String,
    #[pyo3(item)]
    pub aux1: Option<String>,
    #[pyo3(item)]
    pub aux2: Option<String>,
}

/// Mapping resolved to column positions for one sheet.
struct ResolvedMapping {
    primary: usize,
    secondary: usize,
    aux: [Option<usize>; 2],
}

impl FieldMapping {
    fn resolve(&self, dataset: &Dataset, side: &'static str) -> Result<ResolvedMapping, MatchError> {
        let find = |name: &str| {
            dataset.column_index(name).ok_or_else(|| MatchError::MissingColumn {
                side,
                column: name.to_string(),
            })
        };
        let find_aux = |name: &Option<String>| match name {
            Some(n) => find(n).map(Some),
            None => Ok(None),
        };
        Ok(ResolvedMapping {
            primary: find(&self.primary)?,
            secondary: find(&self.secondary)?,
            aux: [find_aux(&self.aux1)?, find_aux(&self.aux2)?],
        })
    }
}

/// Mapped cell values of one row, in slot order. Short rows and absent
/// cells read as None.
fn field_values(row: &[Option<String>], cols: &ResolvedMapping) -> [Option<String>; 4] {
    let get = |idx: Option<usize>| idx.and_then(|i| row.get(i).cloned().flatten());
    [
        get(Some(cols.primary)),
        get(Some(cols.secondary)),
        get(cols.aux[0]),
        get(cols.aux[1]),
    ]
}

/// Per-record precomputation done once per side, so the comparison loop
/// never re-normalizes or re-tokenizes.
#[derive(Debug)]
struct PreparedRecord {
    ordinal: usize,
    raw: [Option<String>; 4],
    norm: [String; 4],
    primary_sorted: String,
    /// Unique sorted tokens per aux slot; None when the role is unmapped.
    aux_tokens: [Option<Vec<String>>; 2],
    blank: bool,
}

fn prepare_record(ordinal: usize, row: &[Option<String>], cols: &ResolvedMapping) -> PreparedRecord {
    let raw = field_values(row, cols);
    let norm = [
        normalize(raw[PRIMARY].as_deref()),
        normalize(raw[SECONDARY].as_deref()),
        normalize(raw[AUX1].as_deref()),
        normalize(raw[AUX2].as_deref()),
    ];
    let blank = is_blank(&norm[PRIMARY]) || is_blank(&norm[SECONDARY]);
    let primary_sorted = sort_tokens(&norm[PRIMARY]);
    let aux_tokens = [
        cols.aux[0].map(|_| unique_tokens(&norm[AUX1])),
        cols.aux[1].map(|_| unique_tokens(&norm[AUX2])),
    ];
    PreparedRecord {
        ordinal,
        raw,
        norm,
        primary_sorted,
        aux_tokens,
        blank,
    }
}

// === CONFIGURATION ===

/// Scoring weights for the four role slots. Must be non-negative and sum
/// to 100; passed as a dict from Python.
#[derive(Debug, Clone, Copy, FromPyObject)]
pub struct Weights {
    #[pyo3(item)]
    pub secondary: f64,
    #[pyo3(item)]
    pub primary: f64,
    #[pyo3(item)]
    pub aux1: f64,
    #[pyo3(item)]
    pub aux2: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            secondary: 40.0,
            primary: 30.0,
            aux1: 15.0,
            aux2: 15.0,
        }
    }
}

/// How the bucket key is derived from a record's mapped fields.
#[derive(Debug, Clone, Copy, FromPyObject)]
pub enum BlockKeyStrategy {
    /// First characters of the normalized primary field plus trailing
    /// digits of the secondary field.
    PrimaryPrefixSecondarySuffix {
        #[pyo3(item)]
        prefix_len: usize,
        #[pyo3(item)]
        suffix_digits: usize,
    },
    /// Trailing digits of the secondary field.
    SecondarySuffix {
        #[pyo3(item)]
        suffix_digits: usize,
    },
}

/// Engine tuning knobs, passed as a dict from Python.
#[derive(Debug, Clone, Copy, FromPyObject)]
pub struct MatchConfig {
    #[pyo3(item)]
    pub top_n: usize,
    #[pyo3(item)]
    pub min_score: f64,
    #[pyo3(item)]
    pub medium_threshold: f64,
    #[pyo3(item)]
    pub high_threshold: f64,
    #[pyo3(item)]
    pub weights: Weights,
    #[pyo3(item)]
    pub block_key: BlockKeyStrategy,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            top_n: 3,
            min_score: 60.0,
            medium_threshold: 70.0,
            high_threshold: 85.0,
            weights: Weights::default(),
            block_key: BlockKeyStrategy::SecondarySuffix { suffix_digits: 4 },
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<(), MatchError> {
        if self.top_n == 0 {
            return Err(MatchError::BadTopN);
        }
        let ordered = 0.0 <= self.min_score
            && self.min_score <= self.medium_threshold
            && self.medium_threshold <= self.high_threshold
            && self.high_threshold <= 100.0;
        if !ordered {
            return Err(MatchError::BadThresholds);
        }
        let w = self.weights;
        let sum = w.secondary + w.primary + w.aux1 + w.aux2;
        let non_negative = w.secondary >= 0.0 && w.primary >= 0.0 && w.aux1 >= 0.0 && w.aux2 >= 0.0;
        if !non_negative || (sum - 100.0).abs() > 1e-6 {
            return Err(MatchError::BadWeights { got: sum });
        }
        match self.block_key {
            BlockKeyStrategy::SecondarySuffix { suffix_digits } if suffix_digits == 0 => {
                Err(MatchError::BadBlockKey)
            }
            BlockKeyStrategy::PrimaryPrefixSecondarySuffix {
                prefix_len,
                suffix_digits,
            } if prefix_len == 0 || suffix_digits == 0 => Err(MatchError::BadBlockKey),
            _ => Ok(()),
        }
    }
}

// === BLOCKING ===

/// Trailing `n` digits of a string, ignoring separators. None when the
/// string contains no digits at all.
fn trailing_digits(s: &str, n: usize) -> Option<String> {
    let digits: Vec<char> = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let start = digits.len().saturating_sub(n);
    Some(digits[start..].iter().collect())
}

/// Derive the bucket key for one record from its normalized fields.
fn block_key(primary_norm: &str, secondary_norm: &str, strategy: BlockKeyStrategy) -> String {
    match strategy {
        BlockKeyStrategy::SecondarySuffix { suffix_digits } => {
            trailing_digits(secondary_norm, suffix_digits).unwrap_or_else(|| UNKEYED.to_string())
        }
        BlockKeyStrategy::PrimaryPrefixSecondarySuffix {
            prefix_len,
            suffix_digits,
        } => {
            let prefix: String = primary_norm.chars().take(prefix_len).collect();
            let suffix = trailing_digits(secondary_norm, suffix_digits);
            if prefix.is_empty() && suffix.is_none() {
                return UNKEYED.to_string();
            }
            format!("{prefix}:{}", suffix.unwrap_or_default())
        }
    }
}

/// Reference records grouped by block key. Built once per run and
/// read-only afterwards, so incoming records can be matched against it
/// from parallel workers without locking.
#[pyclass]
#[derive(Debug)]
pub struct BlockIndex {
    records: Vec<PreparedRecord>,
    buckets: AHashMap<String, Vec<usize>>,
    strategy: BlockKeyStrategy,
}

#[pymethods]
impl BlockIndex {
    /// Number of reference records behind the index.
    #[getter]
    fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of distinct buckets.
    #[getter]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Build the blocking index over the reference sheet.
///
/// Records whose key-source fields carry nothing usable all land in the
/// shared sentinel bucket; that bucket can grow large, which trades some
/// comparison work for never silently dropping a row.
pub fn build_block_index(
    reference: &Dataset,
    mapping: &FieldMapping,
    config: &MatchConfig,
) -> Result<BlockIndex, MatchError> {
    config.validate()?;
    if reference.rows.is_empty() {
        return Err(MatchError::EmptyDataset { side: "reference" });
    }
    let cols = mapping.resolve(reference, "reference")?;

    let mut records = Vec::with_capacity(reference.rows.len());
    let mut buckets: AHashMap<String, Vec<usize>> = AHashMap::new();
    for (ordinal, row) in reference.rows.iter().enumerate() {
        let record = prepare_record(ordinal, row, &cols);
        let key = block_key(&record.norm[PRIMARY], &record.norm[SECONDARY], config.block_key);
        buckets.entry(key).or_default().push(ordinal);
        records.push(record);
    }

    Ok(BlockIndex {
        records,
        buckets,
        strategy: config.block_key,
    })
}

// === SCORING ===

/// Weighted blend of the per-field similarities.
fn weighted_score(
    secondary_match: bool,
    primary_sim: f64,
    aux_sims: [Option<f64>; 2],
    weights: &Weights,
) -> f64 {
    let mut score = 0.0;
    if secondary_match {
        score += weights.secondary;
    }
    score += primary_sim / 100.0 * weights.primary;
    if let Some(sim) = aux_sims[0] {
        score += sim / 100.0 * weights.aux1;
    }
    if let Some(sim) = aux_sims[1] {
        score += sim / 100.0 * weights.aux2;
    }
    score
}

/// One reference row proposed as a duplicate of an incoming row.
///
/// Similarity percentages are None where they were never computed: all of
/// them for exact candidates, and the aux slots when the role is unmapped.
#[derive(Debug, Clone, IntoPyObject)]
pub struct MatchCandidate {
    pub reference_ordinal: usize,
    pub tier: Tier,
    pub score: f64,
    pub secondary_match: bool,
    pub primary_sim: Option<f64>,
    pub aux1_sim: Option<f64>,
    pub aux2_sim: Option<f64>,
}

impl PartialEq for MatchCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MatchCandidate {}

impl PartialOrd for MatchCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MatchCandidate {
    /// Rank order: score, then primary similarity, then earlier reference
    /// row. Total, so heap extraction is reproducible run to run.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| {
                self.primary_sim
                    .unwrap_or(0.0)
                    .total_cmp(&other.primary_sim.unwrap_or(0.0))
            })
            .then_with(|| other.reference_ordinal.cmp(&self.reference_ordinal))
    }
}

/// Token-set similarity for one aux slot; None when the role is unmapped.
fn aux_similarity(a: &Option<Vec<String>>, b: &Option<Vec<String>>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(token_set_similarity_tokens(x, y)),
        _ => None,
    }
}

/// Score one non-blank bucket member against the incoming record.
/// Candidates below the score cutoff are dropped here, not classified.
fn fuzzy_candidate(
    incoming: &PreparedRecord,
    candidate: &PreparedRecord,
    config: &MatchConfig,
) -> Option<MatchCandidate> {
    let secondary_match = incoming.norm[SECONDARY] == candidate.norm[SECONDARY];
    let primary_sim =
        token_sort_similarity_sorted(&incoming.primary_sorted, &candidate.primary_sorted);
    let aux1_sim = aux_similarity(&incoming.aux_tokens[0], &candidate.aux_tokens[0]);
    let aux2_sim = aux_similarity(&incoming.aux_tokens[1], &candidate.aux_tokens[1]);

    let score = weighted_score(secondary_match, primary_sim, [aux1_sim, aux2_sim], &config.weights);
    if score < config.min_score {
        return None;
    }

    Some(MatchCandidate {
        reference_ordinal: candidate.ordinal,
        tier: classify(score, config),
        score,
        secondary_match,
        primary_sim: Some(primary_sim),
        aux1_sim,
        aux2_sim,
    })
}

// === MATCHING PIPELINE ===

/// Ranked candidates for one incoming record.
#[derive(Debug, Clone, IntoPyObject)]
pub struct MatchResult {
    pub source_ordinal: usize,
    pub blank: bool,
    pub candidates: Vec<MatchCandidate>,
    pub candidates_considered: usize,
}

/// Keep the `top_n` best candidates in rank order.
fn take_top(pool: Vec<MatchCandidate>, top_n: usize) -> Vec<MatchCandidate> {
    let mut heap: BinaryHeap<MatchCandidate> = pool.into_iter().collect();
    let mut out = Vec::with_capacity(top_n.min(heap.len()));
    for _ in 0..top_n {
        if let Some(candidate) = heap.pop() {
            out.push(candidate);
        } else {
            break;
        }
    }
    out
}

/// Run one incoming record through blank check, bucket lookup, exact scan
/// and, only when no exact match exists, the fuzzy scorer.
fn match_record(
    incoming: &PreparedRecord,
    index: &BlockIndex,
    config: &MatchConfig,
) -> MatchResult {
    if incoming.blank {
        return MatchResult {
            source_ordinal: incoming.ordinal,
            blank: true,
            candidates: Vec::new(),
            candidates_considered: 0,
        };
    }

    let key = block_key(&incoming.norm[PRIMARY], &incoming.norm[SECONDARY], index.strategy);
    let bucket: &[usize] = index.buckets.get(&key).map(Vec::as_slice).unwrap_or(&[]);

    // Stage 1: equal normalized primaries. Any hit suppresses fuzzy
    // scoring for this record; a pair is exact or fuzzy, never both.
    let mut exact = Vec::new();
    for &ri in bucket {
        let candidate = &index.records[ri];
        if candidate.blank {
            continue;
        }
        if candidate.norm[PRIMARY] == incoming.norm[PRIMARY] {
            exact.push(MatchCandidate {
                reference_ordinal: ri,
                tier: Tier::Exact,
                score: 100.0,
                secondary_match: incoming.norm[SECONDARY] == candidate.norm[SECONDARY],
                primary_sim: None,
                aux1_sim: None,
                aux2_sim: None,
            });
        }
    }

    // Stage 2: weighted fuzzy scoring of the rest of the bucket.
    let pool = if exact.is_empty() {
        bucket
            .iter()
            .filter_map(|&ri| {
                let candidate = &index.records[ri];
                if candidate.blank {
                    None
                } else {
                    fuzzy_candidate(incoming, candidate, config)
                }
            })
            .collect()
    } else {
        exact
    };

    MatchResult {
        source_ordinal: incoming.ordinal,
        blank: false,
        candidates: take_top(pool, config.top_n),
        candidates_considered: bucket.len(),
    }
}

/// Match every incoming record against the index, in parallel, preserving
/// incoming sheet order. Rerunning on unchanged inputs yields identical
/// output.
pub fn find_matches(
    incoming: &Dataset,
    index: &BlockIndex,
    mapping: &FieldMapping,
    config: &MatchConfig,
) -> Result<Vec<MatchResult>, MatchError> {
    config.validate()?;
    if incoming.rows.is_empty() {
        return Err(MatchError::EmptyDataset { side: "incoming" });
    }
    let cols = mapping.resolve(incoming, "incoming")?;

    let prepared: Vec<PreparedRecord> = incoming
        .rows
        .iter()
        .enumerate()
        .map(|(ordinal, row)| prepare_record(ordinal, row, &cols))
        .collect();

    Ok(prepared
        .par_iter()
        .map(|record| match_record(record, index, config))
        .collect())
}

// === AGGREGATION ===

/// Run totals for the host UI's result banner.
#[derive(Debug, Clone, Default, IntoPyObject)]
pub struct MatchSummary {
    pub total_records: usize,
    pub blank_records: usize,
    pub exact_records: usize,
    pub fuzzy_records: usize,
    pub unmatched_records: usize,
    pub high_candidates: usize,
    pub medium_candidates: usize,
    pub low_candidates: usize,
}

pub fn summarize(results: &[MatchResult]) -> MatchSummary {
    let mut summary = MatchSummary {
        total_records: results.len(),
        ..MatchSummary::default()
    };
    for result in results {
        if result.blank {
            summary.blank_records += 1;
        } else if result.candidates.is_empty() {
            summary.unmatched_records += 1;
        } else if result.candidates[0].tier == Tier::Exact {
            summary.exact_records += 1;
        } else {
            summary.fuzzy_records += 1;
        }
        for candidate in &result.candidates {
            match candidate.tier {
                Tier::High => summary.high_candidates += 1,
                Tier::Medium => summary.medium_candidates += 1,
                Tier::Low => summary.low_candidates += 1,
                _ => {}
            }
        }
    }
    summary
}

// === FLATTENING ===

/// One presentation/export row: a single candidate with both sides' raw
/// values. Blank records flatten to a single row with no reference side.
#[derive(Debug, Clone, IntoPyObject)]
pub struct FlatRow {
    pub source_ordinal: usize,
    pub tier: Tier,
    pub score: f64,
    pub incoming_primary: Option<String>,
    pub incoming_secondary: Option<String>,
    pub incoming_aux1: Option<String>,
    pub incoming_aux2: Option<String>,
    pub reference_primary: Option<String>,
    pub reference_secondary: Option<String>,
    pub reference_aux1: Option<String>,
    pub reference_aux2: Option<String>,
    pub secondary_match: Option<bool>,
    pub primary_sim: Option<f64>,
    pub aux1_sim: Option<f64>,
    pub aux2_sim: Option<f64>,
}

/// Flatten results for the presentation/export layer. Records with no
/// candidates (and not blank) produce no rows; the summary accounts for
/// them.
pub fn flatten_results(
    results: &[MatchResult],
    incoming: &Dataset,
    mapping: &FieldMapping,
    index: &BlockIndex,
) -> Result<Vec<FlatRow>, MatchError> {
    let cols = mapping.resolve(incoming, "incoming")?;

    let mut rows = Vec::new();
    for result in results {
        let row = match incoming.rows.get(result.source_ordinal) {
            Some(r) => r,
            None => continue,
        };
        let inc = field_values(row, &cols);

        if result.blank {
            rows.push(FlatRow {
                source_ordinal: result.source_ordinal,
                tier: Tier::Blank,
                score: 0.0,
                incoming_primary: inc[PRIMARY].clone(),
                incoming_secondary: inc[SECONDARY].clone(),
                incoming_aux1: inc[AUX1].clone(),
                incoming_aux2: inc[AUX2].clone(),
                reference_primary: None,
                reference_secondary: None,
                reference_aux1: None,
                reference_aux2: None,
                secondary_match: None,
                primary_sim: None,
                aux1_sim: None,
                aux2_sim: None,
            });
            continue;
        }

        for candidate in &result.candidates {
            let reference = match index.records.get(candidate.reference_ordinal) {
                Some(r) => r,
                None => continue,
            };
            rows.push(FlatRow {
                source_ordinal: result.source_ordinal,
                tier: candidate.tier,
                score: candidate.score,
                incoming_primary: inc[PRIMARY].clone(),
                incoming_secondary: inc[SECONDARY].clone(),
                incoming_aux1: inc[AUX1].clone(),
                incoming_aux2: inc[AUX2].clone(),
                reference_primary: reference.raw[PRIMARY].clone(),
                reference_secondary: reference.raw[SECONDARY].clone(),
                reference_aux1: reference.raw[AUX1].clone(),
                reference_aux2: reference.raw[AUX2].clone(),
                secondary_match: Some(candidate.secondary_match),
                primary_sim: candidate.primary_sim,
                aux1_sim: candidate.aux1_sim,
                aux2_sim: candidate.aux2_sim,
            });
        }
    }
    Ok(rows)
}

// === PYTHON BINDINGS ===

/// Build the blocking index over the reference sheet.
#[pyfunction]
#[pyo3(name = "build_block_index")]
fn build_block_index_py(
    reference: Dataset,
    mapping: FieldMapping,
    config: MatchConfig,
) -> PyResult<BlockIndex> {
    Ok(build_block_index(&reference, &mapping, &config)?)
}

/// Match the incoming sheet against a previously built index.
#[pyfunction]
#[pyo3(name = "find_matches")]
fn find_matches_py(
    incoming: Dataset,
    index: &BlockIndex,
    mapping: FieldMapping,
    config: MatchConfig,
) -> PyResult<Vec<MatchResult>> {
    Ok(find_matches(&incoming, index, &mapping, &config)?)
}

/// Match, flatten and summarize in one call. This is what the sheet UI
/// calls to fill its results table.
#[pyfunction]
#[pyo3(name = "find_matches_flat")]
fn find_matches_flat_py(
    incoming: Dataset,
    index: &BlockIndex,
    mapping: FieldMapping,
    config: MatchConfig,
) -> PyResult<(Vec<FlatRow>, MatchSummary)> {
    let results = find_matches(&incoming, index, &mapping, &config)?;
    let flat = flatten_results(&results, &incoming, &mapping, index)?;
    let summary = summarize(&results);
    Ok((flat, summary))
}

/// Order-insensitive similarity for Python callers: returns 0.0-100.0.
#[pyfunction]
#[pyo3(name = "token_sort_ratio")]
fn token_sort_ratio_py(s1: &str, s2: &str) -> f64 {
    token_sort_similarity(&normalize(Some(s1)), &normalize(Some(s2)))
}

/// Set-based similarity for Python callers: returns 0.0-100.0.
#[pyfunction]
#[pyo3(name = "token_set_ratio")]
fn token_set_ratio_py(s1: &str, s2: &str) -> f64 {
    token_set_similarity(&normalize(Some(s1)), &normalize(Some(s2)))
}

/// A Python module implemented in Rust.
#[pymodule]
fn _rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(build_block_index_py, m)?)?;
    m.add_function(wrap_pyfunction!(find_matches_py, m)?)?;
    m.add_function(wrap_pyfunction!(find_matches_flat_py, m)?)?;
    m.add_function(wrap_pyfunction!(token_sort_ratio_py, m)?)?;
    m.add_function(wrap_pyfunction!(token_set_ratio_py, m)?)?;
    m.add_class::<BlockIndex>()?;
    m.add("ConfigurationError", m.py().get_type::<ConfigurationError>())?;
    m.add("DataError", m.py().get_type::<DataError>())?;
    Ok(())
}
