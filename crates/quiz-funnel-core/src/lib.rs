use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum QuizError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("key derivation error: {0}")]
    KeyDerivation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub Ulid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ResultId(pub Ulid);

impl ResultId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for ResultId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ResultId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One stored answer: a Likert value (`v`), a scenario key (`k`), or both,
/// plus the client-side answer timestamp (`t`, epoch milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnswerEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    pub t: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

impl AnswerEntry {
    /// Validate one answer entry against the submission contract.
    ///
    /// # Errors
    /// Returns [`QuizError::Validation`] when the entry carries neither a
    /// Likert value nor a scenario key, when the Likert value is outside
    /// 1..=5, or when the client timestamp is not positive.
    pub fn validate(&self) -> Result<(), QuizError> {
        if self.v.is_none() && self.k.is_none() {
            return Err(QuizError::Validation(
                "answer must have either v (likert) or k (scenario)".to_string(),
            ));
        }

        if let Some(value) = self.v {
            if !(1..=5).contains(&value) {
                return Err(QuizError::Validation(format!(
                    "likert value MUST be in 1..=5, got {value}"
                )));
            }
        }

        if let Some(key) = &self.k {
            if key.trim().is_empty() {
                return Err(QuizError::Validation(
                    "scenario key MUST be non-empty".to_string(),
                ));
            }
        }

        if self.t <= 0 {
            return Err(QuizError::Validation(
                "answer timestamp MUST be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Question-id keyed answers. `BTreeMap` iteration is lexicographic by key,
/// so canonical ordering is inherent to the type and JSON insertion order
/// never reaches the scorer or the key deriver.
pub type AnswerMap = BTreeMap<String, AnswerEntry>;

/// Validate every entry of an answer map.
///
/// # Errors
/// Returns [`QuizError::Validation`] naming the first offending question id.
pub fn validate_answers(answers: &AnswerMap) -> Result<(), QuizError> {
    for (question_id, entry) in answers {
        entry
            .validate()
            .map_err(|err| QuizError::Validation(format!("answer {question_id}: {err}")))?;
    }
    Ok(())
}

/// Canonical per-answer content: only the fields that carry meaning for
/// deduplication. Client timestamps are deliberately absent.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct CanonicalEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

/// Shape-normalize an answer map into an ordered `[questionId, {v?, k?}]`
/// sequence. Pure and total: entries missing both fields become empty
/// objects rather than errors; semantic validation is a separate concern.
#[must_use]
pub fn canonicalize_answers(answers: &AnswerMap) -> Vec<(String, CanonicalEntry)> {
    answers
        .iter()
        .map(|(question_id, entry)| {
            (question_id.clone(), CanonicalEntry { v: entry.v, k: entry.k.clone() })
        })
        .collect()
}

pub const IDEMPOTENCY_KEY_NAMESPACE: &str = "quiz";
pub const IDEMPOTENCY_KEY_VERSION: u32 = 1;

#[derive(Serialize)]
struct KeyMaterial<'a> {
    v: u32,
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    #[serde(rename = "fingerprintHash")]
    fingerprint_hash: &'a str,
    answers: &'a [(String, CanonicalEntry)],
}

/// Derive the server-trusted idempotency key for one logical submission.
///
/// The key is `quiz:v1:<sha256-hex>` over a fixed-shape JSON document of
/// the format version, session id, fingerprint hash, and canonical answers.
/// Identical logical inputs produce a byte-identical key across calls,
/// processes, and platforms; bumping [`IDEMPOTENCY_KEY_VERSION`] changes the
/// namespace so a future canonicalization scheme cannot collide with old keys.
///
/// # Errors
/// Returns [`QuizError::KeyDerivation`] when the key material cannot be
/// serialized, which indicates a programming error rather than bad input.
pub fn derive_idempotency_key(
    session_id: &str,
    fingerprint_hash: &str,
    answers: &AnswerMap,
) -> Result<String, QuizError> {
    let canonical = canonicalize_answers(answers);
    let material = KeyMaterial {
        v: IDEMPOTENCY_KEY_VERSION,
        session_id,
        fingerprint_hash,
        answers: &canonical,
    };
    let payload = serde_json::to_string(&material)
        .map_err(|err| QuizError::KeyDerivation(err.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Ok(format!("{IDEMPOTENCY_KEY_NAMESPACE}:v{IDEMPOTENCY_KEY_VERSION}:{digest}"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentDimension {
    Secure,
    Anxious,
    Avoidant,
    Disorganized,
}

impl AttachmentDimension {
    /// Tie-break priority order: healthiest pattern first.
    pub const ALL: [Self; 4] = [Self::Secure, Self::Anxious, Self::Avoidant, Self::Disorganized];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Secure => "secure",
            Self::Anxious => "anxious",
            Self::Avoidant => "avoidant",
            Self::Disorganized => "disorganized",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStyle {
    Assertive,
    Passive,
    Aggressive,
    PassiveAggressive,
}

impl CommunicationStyle {
    /// Tie-break priority order: healthiest pattern first.
    pub const ALL: [Self; 4] =
        [Self::Assertive, Self::Passive, Self::Aggressive, Self::PassiveAggressive];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assertive => "assertive",
            Self::Passive => "passive",
            Self::Aggressive => "aggressive",
            Self::PassiveAggressive => "passive_aggressive",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoveLanguage {
    Words,
    Time,
    Service,
    Gifts,
    Touch,
}

impl LoveLanguage {
    pub const ALL: [Self; 5] = [Self::Words, Self::Time, Self::Service, Self::Gifts, Self::Touch];
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MixedMarker {
    Mixed,
}

/// Primary style on one axis: a single winner, a 2-3 way tie, or `"mixed"`
/// when all categories tie.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Primary<T> {
    Single(T),
    Tied(Vec<T>),
    Mixed(MixedMarker),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttachmentResult {
    pub primary: Primary<AttachmentDimension>,
    pub scores: BTreeMap<AttachmentDimension, u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommunicationResult {
    pub primary: Primary<CommunicationStyle>,
    pub scores: BTreeMap<CommunicationStyle, u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntimacyResult {
    pub comfort: u8,
    pub boundaries: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct GiveReceive {
    pub give: u8,
    pub receive: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoveLanguageResult {
    pub ranked: Vec<LoveLanguage>,
    pub scores: BTreeMap<LoveLanguage, u8>,
    pub give_receive: BTreeMap<LoveLanguage, GiveReceive>,
}

/// Metrics-only score shape persisted with a result and returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizScores {
    pub attachment: AttachmentResult,
    pub communication: CommunicationResult,
    pub confidence: u8,
    pub emotional: u8,
    pub intimacy: IntimacyResult,
    pub love_languages: LoveLanguageResult,
}

/// Full output of scoring one answer map. `confidence` here is the
/// archetype selection confidence in 0.0..=1.0, distinct from the 0-100
/// dating-confidence sub-score inside [`QuizScores`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoredQuiz {
    pub scores: QuizScores,
    pub archetype_slug: String,
    pub confidence: f64,
    pub is_balanced: bool,
}

const ATTACHMENT_QUESTIONS: [(AttachmentDimension, [&str; 3]); 4] = [
    (AttachmentDimension::Secure, ["S1", "S2", "S3"]),
    (AttachmentDimension::Anxious, ["AX1", "AX2", "AX3"]),
    (AttachmentDimension::Avoidant, ["AV1", "AV2", "AV3"]),
    (AttachmentDimension::Disorganized, ["D1", "D2", "D3"]),
];

const COMMUNICATION_QUESTIONS: [(CommunicationStyle, [&str; 2]); 4] = [
    (CommunicationStyle::Passive, ["COM_PASSIVE_1", "COM_PASSIVE_2"]),
    (CommunicationStyle::Aggressive, ["COM_AGGRESSIVE_1", "COM_AGGRESSIVE_2"]),
    (CommunicationStyle::PassiveAggressive, ["COM_PAGG_1", "COM_PAGG_2"]),
    (CommunicationStyle::Assertive, ["COM_ASSERTIVE_1", "COM_ASSERTIVE_2"]),
];

const CONFIDENCE_QUESTIONS: [&str; 5] = ["C1", "C2", "C3", "C4", "C5"];
const EMOTIONAL_QUESTIONS: [&str; 5] = ["EA1", "EA2", "EA3", "EA4", "EA5"];
const INTIMACY_COMFORT_QUESTIONS: [&str; 3] = ["IC1", "IC2", "IC3"];
const INTIMACY_BOUNDARY_QUESTIONS: [&str; 3] = ["BA1", "BA2", "BA3"];

const LOVE_LANGUAGE_QUESTIONS: [(LoveLanguage, &str, &str); 5] = [
    (LoveLanguage::Words, "LL1", "LL2"),
    (LoveLanguage::Time, "LL3", "LL4"),
    (LoveLanguage::Service, "LL5", "LL6"),
    (LoveLanguage::Gifts, "LL7", "LL8"),
    (LoveLanguage::Touch, "LL9", "LL10"),
];

/// Negatively-phrased items: higher raw score means lower trait presence.
const REVERSED_QUESTIONS: [&str; 5] = ["C2", "C4", "EA2", "EA4", "BA3"];

const SCENARIO_QUESTION: &str = "COM_SCENARIO_1";
/// One strong-agree response worth of weight; capped at 100 after applying.
const SCENARIO_BONUS: f64 = 25.0;

fn response_value(answers: &AnswerMap, question_id: &str) -> Option<f64> {
    let value = f64::from(answers.get(question_id)?.v?);
    if REVERSED_QUESTIONS.contains(&question_id) {
        Some(6.0 - value)
    } else {
        Some(value)
    }
}

/// Convert a 1-5 raw score to a 0-100 percentage.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn normalize_score(raw: f64) -> u8 {
    (((raw - 1.0) / 4.0) * 100.0).round().clamp(0.0, 100.0) as u8
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let count = values.len() as f64;
    values.iter().sum::<f64>() / count
}

fn averaged_score(answers: &AnswerMap, question_ids: &[&str]) -> u8 {
    let values: Vec<f64> =
        question_ids.iter().filter_map(|id| response_value(answers, id)).collect();
    if values.is_empty() {
        0
    } else {
        normalize_score(average(&values))
    }
}

fn primary_of<T: Copy + Ord>(scores: &BTreeMap<T, u8>, priority: &[T]) -> Primary<T> {
    let max = scores.values().copied().max().unwrap_or(0);
    let top: Vec<T> =
        priority.iter().copied().filter(|key| scores.get(key) == Some(&max)).collect();

    match top.as_slice() {
        [single] => Primary::Single(*single),
        tied if tied.len() == priority.len() => Primary::Mixed(MixedMarker::Mixed),
        tied => Primary::Tied(tied.to_vec()),
    }
}

fn score_attachment(answers: &AnswerMap) -> AttachmentResult {
    let mut scores = BTreeMap::new();
    for (dimension, question_ids) in ATTACHMENT_QUESTIONS {
        scores.insert(dimension, averaged_score(answers, &question_ids));
    }
    let primary = primary_of(&scores, &AttachmentDimension::ALL);
    AttachmentResult { primary, scores }
}

fn score_communication(answers: &AnswerMap) -> CommunicationResult {
    let mut scores = BTreeMap::new();
    for (style, question_ids) in COMMUNICATION_QUESTIONS {
        scores.insert(style, averaged_score(answers, &question_ids));
    }

    // The scenario answer is a behavioral indicator worth roughly one extra
    // strong-agree response for the selected style.
    let scenario_key = answers.get(SCENARIO_QUESTION).and_then(|entry| entry.k.as_deref());
    let scenario_style = match scenario_key {
        Some("A") => Some(CommunicationStyle::Passive),
        Some("B") => Some(CommunicationStyle::Aggressive),
        Some("C") => Some(CommunicationStyle::PassiveAggressive),
        Some("D") => Some(CommunicationStyle::Assertive),
        _ => None,
    };
    if let Some(style) = scenario_style {
        let boosted = f64::from(scores.get(&style).copied().unwrap_or(0)) + SCENARIO_BONUS;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        scores.insert(style, boosted.min(100.0) as u8);
    }

    let primary = primary_of(&scores, &CommunicationStyle::ALL);
    CommunicationResult { primary, scores }
}

fn score_love_languages(answers: &AnswerMap) -> LoveLanguageResult {
    let mut scores = BTreeMap::new();
    let mut give_receive = BTreeMap::new();

    for (language, give_id, receive_id) in LOVE_LANGUAGE_QUESTIONS {
        let give = response_value(answers, give_id);
        let receive = response_value(answers, receive_id);

        give_receive.insert(
            language,
            GiveReceive {
                give: give.map_or(0, normalize_score),
                receive: receive.map_or(0, normalize_score),
            },
        );

        let values: Vec<f64> = [give, receive].into_iter().flatten().collect();
        let combined = if values.is_empty() { 0 } else { normalize_score(average(&values)) };
        scores.insert(language, combined);
    }

    // Stable sort keeps the declaration order for tied languages.
    let mut ranked = LoveLanguage::ALL.to_vec();
    ranked.sort_by_key(|language| std::cmp::Reverse(scores.get(language).copied().unwrap_or(0)));

    LoveLanguageResult { ranked, scores, give_receive }
}

/// If `|joint_a - joint_b| < EPSILON` the two archetype cells are treated
/// as tied and the priority order decides.
const EPSILON: f64 = 0.005;
/// log2(4): maximum entropy of a 4-category distribution.
const MAX_ENTROPY: f64 = 2.0;
/// Both axes above 90% of maximum entropy counts as a balanced profile.
const BALANCED_THRESHOLD: f64 = 0.9;

fn archetype_slug_for(
    attachment: AttachmentDimension,
    communication: CommunicationStyle,
) -> &'static str {
    use AttachmentDimension as A;
    use CommunicationStyle as C;
    match (attachment, communication) {
        (A::Secure, C::Assertive) => "golden-partner",
        (A::Secure, C::Passive) => "gentle-peacekeeper",
        (A::Secure, C::Aggressive) => "direct-director",
        (A::Secure, C::PassiveAggressive) => "playful-tease",
        (A::Anxious, C::Assertive) => "open-book",
        (A::Anxious, C::Passive) => "selfless-giver",
        (A::Anxious, C::Aggressive) => "fiery-pursuer",
        (A::Anxious, C::PassiveAggressive) => "mind-reader",
        (A::Avoidant, C::Assertive) => "solo-voyager",
        (A::Avoidant, C::Passive) => "quiet-ghost",
        (A::Avoidant, C::Aggressive) => "iron-fortress",
        (A::Avoidant, C::PassiveAggressive) => "cool-mystery",
        (A::Disorganized, C::Assertive) => "self-aware-alchemist",
        (A::Disorganized, C::Passive) => "chameleon",
        (A::Disorganized, C::Aggressive) => "wild-storm",
        (A::Disorganized, C::PassiveAggressive) => "labyrinth",
    }
}

/// Normalize raw 0-100 scores to a probability distribution aligned with
/// `keys`. A zero (or degenerate) sum falls back to uniform rather than NaN.
fn normalize_distribution<T: Copy + Ord>(scores: &BTreeMap<T, u8>, keys: &[T]) -> Vec<f64> {
    let sum: f64 = keys.iter().map(|key| f64::from(scores.get(key).copied().unwrap_or(0))).sum();
    if sum <= 0.0 {
        #[allow(clippy::cast_precision_loss)]
        let uniform = 1.0 / keys.len() as f64;
        return vec![uniform; keys.len()];
    }
    keys.iter().map(|key| f64::from(scores.get(key).copied().unwrap_or(0)) / sum).collect()
}

/// Shannon entropy: 0.0 = perfectly peaked, `MAX_ENTROPY` = uniform.
fn entropy(probs: &[f64]) -> f64 {
    -probs.iter().copied().filter(|p| *p > 0.0).map(|p| p * p.log2()).sum::<f64>()
}

struct ArchetypeSelection {
    slug: &'static str,
    confidence: f64,
    is_balanced: bool,
}

fn select_archetype(
    attachment: &AttachmentResult,
    communication: &CommunicationResult,
) -> ArchetypeSelection {
    let p_attach = normalize_distribution(&attachment.scores, &AttachmentDimension::ALL);
    let p_comm = normalize_distribution(&communication.scores, &CommunicationStyle::ALL);

    // Scan the 16 cells in documented priority order; the earliest cell wins
    // unless a later cell beats it by more than EPSILON.
    let mut winner = (AttachmentDimension::Secure, CommunicationStyle::Assertive);
    let mut winner_joint = f64::MIN;
    for (a_index, a_dim) in AttachmentDimension::ALL.iter().enumerate() {
        for (c_index, c_style) in CommunicationStyle::ALL.iter().enumerate() {
            let joint = p_attach[a_index] * p_comm[c_index];
            if joint > winner_joint + EPSILON {
                winner = (*a_dim, *c_style);
                winner_joint = joint;
            }
        }
    }

    let attach_entropy = entropy(&p_attach);
    let comm_entropy = entropy(&p_comm);
    let avg_entropy_ratio = (attach_entropy + comm_entropy) / (2.0 * MAX_ENTROPY);

    ArchetypeSelection {
        slug: archetype_slug_for(winner.0, winner.1),
        confidence: 1.0 - avg_entropy_ratio,
        is_balanced: attach_entropy > BALANCED_THRESHOLD * MAX_ENTROPY
            && comm_entropy > BALANCED_THRESHOLD * MAX_ENTROPY,
    }
}

/// Score one answer map. Pure function of the answers: no clocks, no
/// randomness, so retried submissions always produce the same payload.
#[must_use]
pub fn score_quiz(answers: &AnswerMap) -> ScoredQuiz {
    let attachment = score_attachment(answers);
    let communication = score_communication(answers);
    let selection = select_archetype(&attachment, &communication);

    let scores = QuizScores {
        attachment,
        communication,
        confidence: averaged_score(answers, &CONFIDENCE_QUESTIONS),
        emotional: averaged_score(answers, &EMOTIONAL_QUESTIONS),
        intimacy: IntimacyResult {
            comfort: averaged_score(answers, &INTIMACY_COMFORT_QUESTIONS),
            boundaries: averaged_score(answers, &INTIMACY_BOUNDARY_QUESTIONS),
        },
        love_languages: score_love_languages(answers),
    };

    ScoredQuiz {
        scores,
        archetype_slug: selection.slug.to_string(),
        confidence: selection.confidence,
        is_balanced: selection.is_balanced,
    }
}
