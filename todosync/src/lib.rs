//! Bidirectional sync between checklist items in a note and tasks in a remote to-do service.
//! Modules are ordered leaf first: the task model and its codecs, the content parser, the
//! document and remote boundaries, then the reconciliation cache and the session that drives it.

pub mod core {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------- IDs ------------------------------- */

    /// Identity of a task. Either durable (issued by the remote store) or provisional
    /// (minted locally by [`crate::identity::mint_provisional`]).
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskId(pub String);

    impl TaskId {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        /// True when the remote store has never seen this id.
        pub fn is_provisional(&self) -> bool {
            crate::identity::is_provisional(&self.0)
        }
    }

    impl fmt::Display for TaskId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for TaskId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// Canonical unit shared by the document and the remote store.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub id: TaskId,
        /// Plain text with checklist syntax and identity token stripped.
        pub content: String,
        pub checked: bool,
    }

    impl Task {
        pub fn new(id: TaskId, content: impl Into<String>, checked: bool) -> Self {
            Self {
                id,
                content: content.into(),
                checked,
            }
        }

        /// Compares content and checked state, ignoring identity.
        pub fn same_value(&self, other: &Task) -> bool {
            self.content == other.content && self.checked == other.checked
        }

        pub fn with_id(&self, id: TaskId) -> Task {
            Task {
                id,
                content: self.content.clone(),
                checked: self.checked,
            }
        }
    }

    /// List marker the user typed. Kept so rewrites reproduce it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum Bullet {
        #[default]
        Dash, // -
        Star, // *
        Plus, // +
    }

    impl Bullet {
        pub fn as_char(self) -> char {
            match self {
                Bullet::Dash => '-',
                Bullet::Star => '*',
                Bullet::Plus => '+',
            }
        }

        pub fn from_char(c: char) -> Option<Self> {
            match c {
                '-' => Some(Bullet::Dash),
                '*' => Some(Bullet::Star),
                '+' => Some(Bullet::Plus),
                _ => None,
            }
        }
    }

    /// Replaceable region of one line: byte columns `start..end` on a 0-based `line`.
    /// `start` sits after indentation and quote markers; `end` excludes any `\r`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TextSpan {
        pub line: usize,
        pub start: usize,
        pub end: usize,
    }

    impl TextSpan {
        pub fn slice<'a>(&self, line_text: &'a str) -> &'a str {
            &line_text[self.start..self.end]
        }
    }

    /// One textual appearance of a task inside the document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Occurrence {
        pub task: Task,
        pub bullet: Bullet,
        pub span: TextSpan,
        pub line_number: usize,
        /// The id was minted by this parse; it must be written back before anything else.
        pub is_new: bool,
    }

    /// What a subscription observed on the remote side.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RemoteValue {
        Present(Task),
        Deleted,
    }

    /// Transient user-visible message raised when a remote operation fails for good.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Notice {
        pub task_id: Option<TaskId>,
        pub message: String,
        pub raised_at: DateTime<Utc>,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum CodecError {
        #[error("line is not a checklist item")]
        NotChecklist,
        #[error("unsupported checkbox marker {0:?}")]
        UnsupportedMarker(char),
        #[error("checklist item has no content")]
        EmptyContent,
        #[error("remote id {0:?} uses the reserved provisional format")]
        ProvisionalRemoteId(String),
        #[error("remote id {0:?} cannot be embedded in a note")]
        MalformedRemoteId(String),
    }

    /// Failures reported by the remote task store. Transient ones are retried by the
    /// transport; anything that reaches the reconciliation core is treated as terminal.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum RemoteError {
        #[error("transient remote failure: {0}")]
        Transient(String),
        #[error("remote rejected the credentials")]
        Unauthorized,
        #[error("task {0} not found on remote")]
        NotFound(String),
        #[error("remote rejected the request: {0}")]
        Validation(String),
        #[error("unexpected remote payload: {0}")]
        Decode(String),
    }

    impl RemoteError {
        pub fn is_transient(&self) -> bool {
            matches!(self, RemoteError::Transient(_))
        }
    }

    impl From<CodecError> for RemoteError {
        fn from(err: CodecError) -> Self {
            RemoteError::Decode(err.to_string())
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum SurfaceError {
        #[error("line {line} is out of range ({len} lines)")]
        LineOutOfRange { line: usize, len: usize },
        #[error("span {start}..{end} does not fit line {line} ({len} bytes)")]
        SpanOutOfRange {
            line: usize,
            start: usize,
            end: usize,
            len: usize,
        },
        #[error("document I/O failed: {0}")]
        Io(#[from] std::io::Error),
    }
}

pub mod identity {
    //! Provisional identities for tasks the remote store has not accepted yet.
    //!
    //! Remote ids are never allowed to start with [`PROVISIONAL_PREFIX`] (the remote codec
    //! rejects them), so the prefix alone tells the two kinds apart.

    use crate::core::TaskId;
    use uuid::Uuid;

    pub const PROVISIONAL_PREFIX: &str = "local-";

    /// Mint a fresh provisional id, `local-<32 hex>`.
    pub fn mint_provisional() -> TaskId {
        TaskId(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn is_provisional(id: &str) -> bool {
        id.starts_with(PROVISIONAL_PREFIX)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::HashSet;

        #[test]
        fn minted_ids_are_provisional_and_unique() {
            let ids: HashSet<_> = (0..1000).map(|_| mint_provisional()).collect();
            assert_eq!(ids.len(), 1000);
            assert!(ids.iter().all(|id| id.is_provisional()));
        }

        #[test]
        fn remote_ids_are_durable() {
            for id in ["2995104339", "6Jf8VQXxpwv56VQ7", "T1"] {
                assert!(!is_provisional(id), "{id} should be durable");
            }
        }
    }
}

pub mod codec {
    //! Two encodings of a [`Task`]: the checklist markup stored in notes and the JSON payload
    //! exchanged with the remote store.
    //!
    //! Markup (after indentation and quote markers have been stripped):
    //! `<bullet> [<mark>] <content>[ %%[tid:: <id>]%%]`

    use crate::core::*;
    use crate::identity::{PROVISIONAL_PREFIX, mint_provisional};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1},
        character::complete::{anychar, char, one_of, space0, space1},
        combinator::{eof, map, map_opt, rest},
        error::VerboseError,
        sequence::{delimited, pair, preceded, tuple},
    };
    use serde::{Deserialize, Serialize};

    pub const TOKEN_OPEN: &str = "%%[tid::";
    pub const TOKEN_CLOSE: &str = "]%%";

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------ Markup ------------------------------ */

    /// Result of decoding one canonical checklist line. `id` is `None` for a task that has
    /// never been synced.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MarkupLine {
        pub bullet: Bullet,
        pub id: Option<TaskId>,
        pub content: String,
        pub checked: bool,
    }

    impl MarkupLine {
        /// Resolve into a task, minting a provisional id when the line carried none.
        /// The flag is true when an id was minted.
        pub fn into_task(self) -> (Task, bool) {
            let (id, minted) = match self.id {
                Some(id) => (id, false),
                None => (mint_provisional(), true),
            };
            (Task::new(id, self.content, self.checked), minted)
        }
    }

    /// `- [ ]`, `* [x]`, ... The mark is returned raw so callers can reject unknown ones.
    pub(crate) fn checklist_head(i: &str) -> PResult<'_, (Bullet, char)> {
        tuple((
            map_opt(one_of("-*+"), Bullet::from_char),
            preceded(space1, delimited(char('['), anychar, char(']'))),
        ))(i)
    }

    fn checklist_line(i: &str) -> PResult<'_, (Bullet, char, &str)> {
        map(
            tuple((checklist_head, alt((space1, eof)), rest)),
            |((bullet, mark), _, content)| (bullet, mark, content),
        )(i)
    }

    fn identity_token(i: &str) -> PResult<'_, &str> {
        delimited(
            pair(tag(TOKEN_OPEN), space0),
            take_till1(|c: char| c == ']' || c.is_whitespace()),
            pair(space0, tag(TOKEN_CLOSE)),
        )(i)
    }

    /// Remove every well-formed identity token from `content`. The last one names the task,
    /// since encoding always appends the token after the content.
    fn split_identity(content: &str) -> (Option<TaskId>, String) {
        let mut id = None;
        let mut segments = Vec::new();
        let mut start = 0;
        let mut cursor = 0;
        while let Some(found) = content[cursor..].find(TOKEN_OPEN) {
            let at = cursor + found;
            match identity_token(&content[at..]) {
                Ok((after, token)) => {
                    segments.push(&content[start..at]);
                    id = Some(TaskId::new(token));
                    start = content.len() - after.len();
                    cursor = start;
                }
                Err(_) => cursor = at + TOKEN_OPEN.len(),
            }
        }
        segments.push(&content[start..]);

        let text = segments
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (id, text)
    }

    pub fn decode_markup(markup: &str) -> Result<MarkupLine, CodecError> {
        let (_, (bullet, mark, raw)) =
            checklist_line(markup).map_err(|_| CodecError::NotChecklist)?;
        let checked = match mark {
            ' ' => false,
            'x' | 'X' => true,
            other => return Err(CodecError::UnsupportedMarker(other)),
        };
        let (id, content) = split_identity(raw);
        if content.is_empty() {
            return Err(CodecError::EmptyContent);
        }
        Ok(MarkupLine {
            bullet,
            id,
            content,
            checked,
        })
    }

    pub fn identity_token_for(id: &TaskId) -> String {
        format!("{TOKEN_OPEN} {id}{TOKEN_CLOSE}")
    }

    pub fn encode_markup(task: &Task) -> String {
        encode_markup_with(Bullet::default(), task)
    }

    pub fn encode_markup_with(bullet: Bullet, task: &Task) -> String {
        let mark = if task.checked { 'x' } else { ' ' };
        // A stray token in the content would compete with the appended one.
        let content = if task.content.contains(TOKEN_OPEN) {
            split_identity(&task.content).1
        } else {
            task.content.clone()
        };
        format!(
            "{} [{}] {} {}",
            bullet.as_char(),
            mark,
            content,
            identity_token_for(&task.id)
        )
    }

    /* ------------------------------ Remote ------------------------------ */

    /// Task as the remote store serialises it. `checked` is accepted as an alias because the
    /// store's item endpoint and its REST endpoint disagree on the name.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RemoteTaskPayload {
        pub id: String,
        pub content: String,
        #[serde(default, alias = "checked")]
        pub is_completed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub project_id: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        pub is_deleted: bool,
    }

    impl RemoteTaskPayload {
        pub fn from_task(task: &Task, project_id: Option<String>) -> Self {
            Self {
                id: task.id.0.clone(),
                content: task.content.clone(),
                is_completed: task.checked,
                project_id,
                is_deleted: false,
            }
        }
    }

    impl TryFrom<RemoteTaskPayload> for Task {
        type Error = CodecError;

        fn try_from(payload: RemoteTaskPayload) -> Result<Self, Self::Error> {
            let id = validate_remote_id(&payload.id)?;
            // Notes hold one task per line.
            let flat = payload
                .content
                .split(['\n', '\r'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            // Token text from the store would otherwise take over the line's identity.
            let (_, content) = split_identity(&flat);
            if content.is_empty() {
                return Err(CodecError::EmptyContent);
            }
            Ok(Task::new(id, content, payload.is_completed))
        }
    }

    fn validate_remote_id(id: &str) -> Result<TaskId, CodecError> {
        if id.starts_with(PROVISIONAL_PREFIX) {
            return Err(CodecError::ProvisionalRemoteId(id.to_string()));
        }
        if id.is_empty() || id.contains(|c: char| c == ']' || c.is_whitespace()) {
            return Err(CodecError::MalformedRemoteId(id.to_string()));
        }
        Ok(TaskId::new(id))
    }

    /// Body of a create request. The store assigns the id.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NewTaskPayload {
        pub content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub project_id: Option<String>,
    }

    impl NewTaskPayload {
        pub fn from_task(task: &Task, project_id: Option<String>) -> Self {
            Self {
                content: task.content.clone(),
                project_id,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ContentUpdatePayload<'a> {
        pub content: &'a str,
    }

}

pub mod parser {
    //! Content parser: full note text in, checklist occurrences out, in document order.
    //!
    //! Parsing strategy:
    //! - The scan is line-oriented. A single flag tracks fenced code; a line whose trimmed
    //!   content starts with the fence marker toggles it and is never a task itself.
    //! - Outside fences each line is split with `nom` into a prefix (indentation and any
    //!   number of nested `>` quote markers) and the canonical markup handed to the codec.
    //! - Lines that look like checklist items but do not decode are skipped. The parser
    //!   never fails; bad input only yields fewer occurrences.

    use crate::codec::{PResult, checklist_head, decode_markup};
    use crate::core::*;
    use nom::{
        character::complete::{char, space0},
        combinator::recognize,
        multi::many0_count,
        sequence::pair,
    };
    use tracing::trace;

    pub const FENCE_MARKER: &str = "```";

    /// Indentation, then zero or more quote markers each followed by optional whitespace.
    fn line_prefix(i: &str) -> PResult<'_, &str> {
        recognize(pair(space0, many0_count(pair(char('>'), space0))))(i)
    }

    /// Parse every checklist occurrence in `text`. Tokenless items get a freshly minted
    /// provisional id and are flagged `is_new`.
    pub fn parse_occurrences(text: &str) -> Vec<Occurrence> {
        let mut out = Vec::new();
        let mut in_fence = false;

        for (line_number, raw) in text.split('\n').enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.trim_start().starts_with(FENCE_MARKER) {
                in_fence = !in_fence;
                continue;
            }
            if in_fence {
                continue;
            }
            if let Some(occurrence) = parse_line(line_number, line) {
                out.push(occurrence);
            }
        }
        out
    }

    fn parse_line(line_number: usize, line: &str) -> Option<Occurrence> {
        let (markup, prefix) = line_prefix(line).ok()?;
        let decoded = match decode_markup(markup) {
            Ok(decoded) => decoded,
            Err(err) => {
                if checklist_head(markup).is_ok() {
                    trace!(line = line_number, %err, "skipping malformed checklist item");
                }
                return None;
            }
        };
        let bullet = decoded.bullet;
        let (task, is_new) = decoded.into_task();
        Some(Occurrence {
            task,
            bullet,
            span: TextSpan {
                line: line_number,
                start: prefix.len(),
                end: line.len(),
            },
            line_number,
            is_new,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::codec::encode_markup_with;
        use crate::surface::replace_span;

        fn contents(occurrences: &[Occurrence]) -> Vec<&str> {
            occurrences.iter().map(|o| o.task.content.as_str()).collect()
        }

        #[test]
        fn new_tasks_are_flagged_and_get_provisional_ids() {
            let occurrences = parse_occurrences("- [ ] Task 1\n- [x] Task 2");
            assert_eq!(contents(&occurrences), ["Task 1", "Task 2"]);
            assert!(occurrences.iter().all(|o| o.is_new && o.task.id.is_provisional()));
            assert!(!occurrences[0].task.checked);
            assert!(occurrences[1].task.checked);
            assert_eq!(occurrences[1].line_number, 1);
        }

        #[test]
        fn write_back_makes_identity_stable() {
            let text = "- [ ] Buy milk";
            let first = parse_occurrences(text).remove(0);
            assert!(first.is_new);

            let markup = encode_markup_with(first.bullet, &first.task);
            let rewritten = replace_span(text, &first.span, &markup).unwrap();
            let again = parse_occurrences(&rewritten);
            assert_eq!(again.len(), 1);
            assert!(!again[0].is_new);
            assert_eq!(again[0].task.id, first.task.id);
            assert_eq!(parse_occurrences(&rewritten)[0].task.id, first.task.id);
        }

        #[test]
        fn fenced_code_is_excluded() {
            let text = "- [ ] before\n```\n- [ ] inside\n```\n- [ ] after";
            assert_eq!(contents(&parse_occurrences(text)), ["before", "after"]);
        }

        #[test]
        fn unterminated_fence_swallows_the_rest() {
            let text = "- [ ] kept\n  ```rust\n- [ ] code\n- [x] still code";
            assert_eq!(contents(&parse_occurrences(text)), ["kept"]);
        }

        #[test]
        fn empty_fence_pair_changes_nothing() {
            let text = "```\n```\n- [ ] a\nnot a task\n- [ ] b";
            assert_eq!(contents(&parse_occurrences(text)), ["a", "b"]);
        }

        #[test]
        fn quote_prefix_is_cumulative_and_excluded_from_span() {
            let text = concat!(
                "> [!todo] Errands\n",
                "> - [ ] one %%[tid:: 1]%%\n",
                "> > - [x] two %%[tid:: 2]%%\n",
                ">>   * [ ] three %%[tid:: 3]%%",
            );
            let occurrences = parse_occurrences(text);
            assert_eq!(contents(&occurrences), ["one", "two", "three"]);
            assert_eq!(occurrences[0].span.start, 2);
            assert_eq!(occurrences[1].span.start, 4);
            assert_eq!(occurrences[2].span.start, 5);
            assert_eq!(occurrences[2].bullet, Bullet::Star);

            let line = text.lines().nth(2).unwrap();
            assert_eq!(
                occurrences[1].span.slice(line),
                "- [x] two %%[tid:: 2]%%"
            );
        }

        #[test]
        fn indentation_and_crlf_are_handled() {
            let text = "\t- [ ] tabbed %%[tid:: 8]%%\r\n    + [X] spaced\r\n";
            let occurrences = parse_occurrences(text);
            assert_eq!(contents(&occurrences), ["tabbed", "spaced"]);
            assert_eq!(occurrences[0].span.start, 1);
            assert_eq!(
                occurrences[0].span.end,
                "\t- [ ] tabbed %%[tid:: 8]%%".len()
            );
            assert_eq!(occurrences[0].task.id, TaskId::from("8"));
        }

        #[test]
        fn malformed_items_are_skipped() {
            let text = "- [-] cancelled\n- [ ]\n- [ ] fine\n* plain bullet";
            assert_eq!(contents(&parse_occurrences(text)), ["fine"]);
        }
    }
}

pub mod surface {
    //! Where the note text lives. A live editor buffer and a file on disk both implement
    //! [`DocumentSurface`]; nothing above this module assumes an editor is present.
    //!
    //! Writes are whole-span replacements computed from the current text. A span that no
    //! longer fits is an error and nothing is written.

    use crate::core::{SurfaceError, TextSpan};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::SystemTime;

    #[async_trait]
    pub trait DocumentSurface: Send + Sync {
        async fn read(&self) -> Result<String, SurfaceError>;

        /// Replace exactly `span` with `text`, leaving the rest of the document untouched.
        async fn write_span(&self, span: &TextSpan, text: &str) -> Result<(), SurfaceError>;

        /// Remove `line` together with its line break.
        async fn remove_line(&self, line: usize) -> Result<(), SurfaceError>;
    }

    /* ------------------------------ Text edits ------------------------------ */

    struct LineBounds {
        start: usize,
        content_end: usize, // before any '\r'
        end: usize,         // index of the '\n', or text.len() on the last line
    }

    fn line_bounds(text: &str, line: usize) -> Result<LineBounds, SurfaceError> {
        let mut start = 0;
        let mut count = 0;
        for (idx, segment) in text.split('\n').enumerate() {
            count = idx + 1;
            let end = start + segment.len();
            if idx == line {
                let content = segment.strip_suffix('\r').unwrap_or(segment);
                return Ok(LineBounds {
                    start,
                    content_end: start + content.len(),
                    end,
                });
            }
            start = end + 1;
        }
        Err(SurfaceError::LineOutOfRange { line, len: count })
    }

    pub fn replace_span(
        text: &str,
        span: &TextSpan,
        replacement: &str,
    ) -> Result<String, SurfaceError> {
        let bounds = line_bounds(text, span.line)?;
        let line = &text[bounds.start..bounds.content_end];
        let fits = span.start <= span.end
            && span.end <= line.len()
            && line.is_char_boundary(span.start)
            && line.is_char_boundary(span.end);
        if !fits {
            return Err(SurfaceError::SpanOutOfRange {
                line: span.line,
                start: span.start,
                end: span.end,
                len: line.len(),
            });
        }

        let mut out = String::with_capacity(text.len() + replacement.len());
        out.push_str(&text[..bounds.start + span.start]);
        out.push_str(replacement);
        out.push_str(&text[bounds.start + span.end..]);
        Ok(out)
    }

    pub fn remove_line(text: &str, line: usize) -> Result<String, SurfaceError> {
        let bounds = line_bounds(text, line)?;
        let (from, to) = if bounds.end < text.len() {
            (bounds.start, bounds.end + 1)
        } else if bounds.start > 0 {
            // Last line: take the preceding break instead.
            (bounds.start - 1, bounds.end)
        } else {
            (0, bounds.end)
        };
        Ok(format!("{}{}", &text[..from], &text[to..]))
    }

    /* ------------------------------ Editor buffer ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cursor {
        pub line: usize,
        pub column: usize,
    }

    #[derive(Debug, Default)]
    struct BufferState {
        text: String,
        cursor: Option<Cursor>,
    }

    /// In-memory editor buffer with an optional cursor. Writes on the cursor's line keep the
    /// cursor on the same character.
    #[derive(Debug, Default)]
    pub struct BufferSurface {
        state: Mutex<BufferState>,
    }

    impl BufferSurface {
        pub fn new(text: impl Into<String>) -> Self {
            Self {
                state: Mutex::new(BufferState {
                    text: text.into(),
                    cursor: None,
                }),
            }
        }

        fn lock(&self) -> MutexGuard<'_, BufferState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn text(&self) -> String {
            self.lock().text.clone()
        }

        /// Simulates the user typing: replaces the whole buffer.
        pub fn set_text(&self, text: impl Into<String>) {
            self.lock().text = text.into();
        }

        pub fn cursor(&self) -> Option<Cursor> {
            self.lock().cursor
        }

        pub fn set_cursor(&self, cursor: Option<Cursor>) {
            self.lock().cursor = cursor;
        }
    }

    fn shift_cursor(cursor: &mut Cursor, span: &TextSpan, inserted: usize) {
        if cursor.line != span.line || cursor.column < span.start {
            return;
        }
        if cursor.column >= span.end {
            cursor.column = cursor.column - span.end + span.start + inserted;
        } else {
            cursor.column = span.start + (cursor.column - span.start).min(inserted);
        }
    }

    #[async_trait]
    impl DocumentSurface for BufferSurface {
        async fn read(&self) -> Result<String, SurfaceError> {
            Ok(self.lock().text.clone())
        }

        async fn write_span(&self, span: &TextSpan, text: &str) -> Result<(), SurfaceError> {
            let mut state = self.lock();
            state.text = replace_span(&state.text, span, text)?;
            if let Some(cursor) = state.cursor.as_mut() {
                shift_cursor(cursor, span, text.len());
            }
            Ok(())
        }

        async fn remove_line(&self, line: usize) -> Result<(), SurfaceError> {
            let mut state = self.lock();
            state.text = remove_line(&state.text, line)?;
            if let Some(cursor) = state.cursor.as_mut() {
                if cursor.line > line {
                    cursor.line -= 1;
                } else if cursor.line == line {
                    cursor.column = 0;
                }
            }
            Ok(())
        }
    }

    /* ------------------------------ File on disk ------------------------------ */

    /// Direct-to-disk surface for documents that are not open in an editor.
    #[derive(Debug, Clone)]
    pub struct FileSurface {
        path: PathBuf,
    }

    impl FileSurface {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub async fn modified(&self) -> Result<Option<SystemTime>, SurfaceError> {
            let metadata = tokio::fs::metadata(&self.path).await?;
            Ok(metadata.modified().ok())
        }
    }

    #[async_trait]
    impl DocumentSurface for FileSurface {
        async fn read(&self) -> Result<String, SurfaceError> {
            Ok(tokio::fs::read_to_string(&self.path).await?)
        }

        async fn write_span(&self, span: &TextSpan, text: &str) -> Result<(), SurfaceError> {
            let current = self.read().await?;
            let updated = replace_span(&current, span, text)?;
            tokio::fs::write(&self.path, updated).await?;
            Ok(())
        }

        async fn remove_line(&self, line: usize) -> Result<(), SurfaceError> {
            let current = self.read().await?;
            let updated = remove_line(&current, line)?;
            tokio::fs::write(&self.path, updated).await?;
            Ok(())
        }
    }

}

pub mod remote {
    //! Remote task store boundary.
    //!
    //! - [`RemoteTaskStore`] is the CRUD surface the session consumes.
    //! - [`RestTaskStore`] talks to a Todoist-style REST API over `reqwest`; transient failures
    //!   are retried here with bounded exponential backoff, so callers only ever see success or
    //!   a terminal error.
    //! - [`InMemoryTaskStore`] is an in-process store for offline runs and tests.

    use crate::codec::{ContentUpdatePayload, NewTaskPayload, RemoteTaskPayload};
    use crate::core::*;
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use reqwest::{Client, RequestBuilder, Response, StatusCode};
    use serde::{Deserialize, Serialize};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;
    use tracing::{debug, warn};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Project {
        pub id: String,
        pub name: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct UserProfile {
        pub full_name: String,
        pub email: String,
    }

    #[async_trait]
    pub trait RemoteTaskStore: Send + Sync {
        /// Current value of a task; `Deleted` when the store no longer knows it.
        async fn get_task(&self, id: &TaskId) -> Result<RemoteValue, RemoteError>;

        /// Create a task. The store assigns the durable id.
        async fn create_task(&self, draft: &NewTaskPayload) -> Result<Task, RemoteError>;

        async fn update_content(&self, id: &TaskId, content: &str) -> Result<Task, RemoteError>;

        /// Close (`true`) or reopen (`false`) a task.
        async fn set_checked(&self, id: &TaskId, checked: bool) -> Result<Task, RemoteError>;

        /// Settings helpers; the sync core never calls these.
        async fn list_projects(&self) -> Result<Vec<Project>, RemoteError>;
        async fn current_user(&self) -> Result<UserProfile, RemoteError>;
    }

    /* ------------------------------- Retry ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RetryPolicy {
        /// Total attempts, first call included.
        pub max_attempts: u32,
        pub base_delay: Duration,
        pub max_delay: Duration,
    }

    impl Default for RetryPolicy {
        fn default() -> Self {
            Self {
                max_attempts: 4,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(8),
            }
        }
    }

    impl RetryPolicy {
        /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
        pub fn delay_for(&self, attempt: u32) -> Duration {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.base_delay.saturating_mul(factor).min(self.max_delay)
        }

        pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RemoteError>
        where
            F: FnMut() -> Fut,
            Fut: Future<Output = Result<T, RemoteError>>,
        {
            let mut attempt = 1;
            loop {
                match call().await {
                    Err(err) if err.is_transient() && attempt < self.max_attempts => {
                        let delay = self.delay_for(attempt);
                        warn!(operation, attempt, ?delay, %err, "transient remote failure");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    other => return other,
                }
            }
        }
    }

    /* ------------------------------- REST ------------------------------- */

    pub const DEFAULT_API_URL: &str = "https://api.todoist.com/rest/v2";
    pub const DEFAULT_SYNC_URL: &str = "https://api.todoist.com/sync/v9";

    #[derive(Debug, Deserialize)]
    struct ItemEnvelope {
        item: RemoteTaskPayload,
    }

    #[derive(Debug, Deserialize)]
    struct UserEnvelope {
        user: UserProfile,
    }

    /// Map a non-success HTTP status onto the remote error taxonomy.
    pub fn classify_status(
        status: StatusCode,
        body: &str,
        subject: Option<&TaskId>,
    ) -> RemoteError {
        match status.as_u16() {
            401 | 403 => RemoteError::Unauthorized,
            404 => RemoteError::NotFound(
                subject.map_or_else(|| "resource".to_string(), |id| id.to_string()),
            ),
            408 | 429 => RemoteError::Transient(format!("{status}")),
            code if code >= 500 => RemoteError::Transient(format!("{status}")),
            _ => {
                let detail: String = body.chars().take(200).collect();
                RemoteError::Validation(format!("{status}: {detail}"))
            }
        }
    }

    fn transport_error(err: reqwest::Error) -> RemoteError {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transient(err.to_string())
        }
    }

    async fn decode_json<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, RemoteError> {
        response
            .json::<T>()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }

    pub struct RestTaskStore {
        client: Client,
        api_url: String,
        sync_url: String,
        token: String,
        retry: RetryPolicy,
    }

    impl RestTaskStore {
        pub fn new(
            api_url: impl Into<String>,
            sync_url: impl Into<String>,
            token: impl Into<String>,
            retry: RetryPolicy,
        ) -> Self {
            Self {
                client: Client::new(),
                api_url: api_url.into().trim_end_matches('/').to_string(),
                sync_url: sync_url.into().trim_end_matches('/').to_string(),
                token: token.into(),
                retry,
            }
        }

        async fn execute(
            &self,
            request: RequestBuilder,
            subject: Option<&TaskId>,
        ) -> Result<Response, RemoteError> {
            let response = request
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(transport_error)?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body, subject))
        }
    }

    #[async_trait]
    impl RemoteTaskStore for RestTaskStore {
        async fn get_task(&self, id: &TaskId) -> Result<RemoteValue, RemoteError> {
            // The item endpoint also returns completed tasks, which the REST one hides.
            let url = format!("{}/items/get", self.sync_url);
            let form = [("item_id", id.as_str()), ("all_data", "false")];
            let result = self
                .retry
                .run("get_task", move || {
                    self.execute(self.client.post(&url).form(&form[..]), Some(id))
                })
                .await;
            match result {
                Ok(response) => {
                    let envelope: ItemEnvelope = decode_json(response).await?;
                    if envelope.item.is_deleted {
                        return Ok(RemoteValue::Deleted);
                    }
                    Ok(RemoteValue::Present(Task::try_from(envelope.item)?))
                }
                Err(RemoteError::NotFound(_)) => Ok(RemoteValue::Deleted),
                Err(err) => Err(err),
            }
        }

        async fn create_task(&self, draft: &NewTaskPayload) -> Result<Task, RemoteError> {
            let url = format!("{}/tasks", self.api_url);
            // Same request id on every attempt so a retried create is not duplicated.
            let request_id = Uuid::new_v4().to_string();
            let response = self
                .retry
                .run("create_task", move || {
                    let request = self
                        .client
                        .post(&url)
                        .header("X-Request-Id", &request_id)
                        .json(draft);
                    self.execute(request, None)
                })
                .await?;
            let payload: RemoteTaskPayload = decode_json(response).await?;
            debug!(task_id = %payload.id, "remote task created");
            Ok(Task::try_from(payload)?)
        }

        async fn update_content(&self, id: &TaskId, content: &str) -> Result<Task, RemoteError> {
            let url = format!("{}/tasks/{}", self.api_url, id);
            let body = ContentUpdatePayload { content };
            let response = self
                .retry
                .run("update_content", move || {
                    self.execute(self.client.post(&url).json(&body), Some(id))
                })
                .await?;
            let payload: RemoteTaskPayload = decode_json(response).await?;
            Ok(Task::try_from(payload)?)
        }

        async fn set_checked(&self, id: &TaskId, checked: bool) -> Result<Task, RemoteError> {
            let action = if checked { "close" } else { "reopen" };
            let url = format!("{}/tasks/{}/{}", self.api_url, id, action);
            self.retry
                .run("set_checked", move || {
                    self.execute(self.client.post(&url), Some(id))
                })
                .await?;
            match self.get_task(id).await? {
                RemoteValue::Present(task) => Ok(task),
                RemoteValue::Deleted => Err(RemoteError::NotFound(id.to_string())),
            }
        }

        async fn list_projects(&self) -> Result<Vec<Project>, RemoteError> {
            let url = format!("{}/projects", self.api_url);
            let response = self
                .retry
                .run("list_projects", move || {
                    self.execute(self.client.get(&url), None)
                })
                .await?;
            decode_json(response).await
        }

        async fn current_user(&self) -> Result<UserProfile, RemoteError> {
            let url = format!("{}/sync", self.sync_url);
            let form = [("sync_token", "*"), ("resource_types", r#"["user"]"#)];
            let response = self
                .retry
                .run("current_user", move || {
                    self.execute(self.client.post(&url).form(&form[..]), None)
                })
                .await?;
            let envelope: UserEnvelope = decode_json(response).await?;
            Ok(envelope.user)
        }
    }

    /* ------------------------------ In memory ------------------------------ */

    /// Calls observed by [`InMemoryTaskStore`], in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RemoteCall {
        Get(TaskId),
        Create(String),
        UpdateContent(TaskId, String),
        SetChecked(TaskId, bool),
    }

    #[derive(Debug, Default)]
    struct MemoryState {
        tasks: IndexMap<TaskId, Task>,
        projects: Vec<Project>,
        next_id: u64,
        failures: VecDeque<RemoteError>,
        calls: Vec<RemoteCall>,
    }

    impl MemoryState {
        fn take_failure(&mut self) -> Result<(), RemoteError> {
            match self.failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    /// In-process store. Issues ids `T1`, `T2`, ...
    #[derive(Debug, Default)]
    pub struct InMemoryTaskStore {
        state: Mutex<MemoryState>,
    }

    impl InMemoryTaskStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
            let store = Self::new();
            for task in tasks {
                store.insert(task);
            }
            store
        }

        fn lock(&self) -> MutexGuard<'_, MemoryState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn insert(&self, task: Task) {
            self.lock().tasks.insert(task.id.clone(), task);
        }

        pub fn add_project(&self, project: Project) {
            self.lock().projects.push(project);
        }

        pub fn task(&self, id: &TaskId) -> Option<Task> {
            self.lock().tasks.get(id).cloned()
        }

        pub fn len(&self) -> usize {
            self.lock().tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Edit a task as another client would. Returns false for unknown ids.
        pub fn edit_remote(&self, id: &TaskId, content: &str, checked: bool) -> bool {
            match self.lock().tasks.get_mut(id) {
                Some(task) => {
                    task.content = content.to_string();
                    task.checked = checked;
                    true
                }
                None => false,
            }
        }

        pub fn delete_remote(&self, id: &TaskId) -> bool {
            self.lock().tasks.shift_remove(id).is_some()
        }

        /// The next call fails with `err`. Queued failures are consumed in order.
        pub fn fail_next(&self, err: RemoteError) {
            self.lock().failures.push_back(err);
        }

        pub fn calls(&self) -> Vec<RemoteCall> {
            self.lock().calls.clone()
        }
    }

    #[async_trait]
    impl RemoteTaskStore for InMemoryTaskStore {
        async fn get_task(&self, id: &TaskId) -> Result<RemoteValue, RemoteError> {
            let mut state = self.lock();
            state.calls.push(RemoteCall::Get(id.clone()));
            state.take_failure()?;
            Ok(match state.tasks.get(id) {
                Some(task) => RemoteValue::Present(task.clone()),
                None => RemoteValue::Deleted,
            })
        }

        async fn create_task(&self, draft: &NewTaskPayload) -> Result<Task, RemoteError> {
            let mut state = self.lock();
            state.calls.push(RemoteCall::Create(draft.content.clone()));
            state.take_failure()?;
            state.next_id += 1;
            let id = TaskId(format!("T{}", state.next_id));
            let task = Task::new(id, draft.content.clone(), false);
            state.tasks.insert(task.id.clone(), task.clone());
            Ok(task)
        }

        async fn update_content(&self, id: &TaskId, content: &str) -> Result<Task, RemoteError> {
            let mut state = self.lock();
            state
                .calls
                .push(RemoteCall::UpdateContent(id.clone(), content.to_string()));
            state.take_failure()?;
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            task.content = content.to_string();
            Ok(task.clone())
        }

        async fn set_checked(&self, id: &TaskId, checked: bool) -> Result<Task, RemoteError> {
            let mut state = self.lock();
            state.calls.push(RemoteCall::SetChecked(id.clone(), checked));
            state.take_failure()?;
            let task = state
                .tasks
                .get_mut(id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            task.checked = checked;
            Ok(task.clone())
        }

        async fn list_projects(&self) -> Result<Vec<Project>, RemoteError> {
            let mut state = self.lock();
            state.take_failure()?;
            Ok(state.projects.clone())
        }

        async fn current_user(&self) -> Result<UserProfile, RemoteError> {
            self.lock().take_failure()?;
            Ok(UserProfile {
                full_name: "Offline User".into(),
                email: "offline@localhost".into(),
            })
        }
    }

}

pub mod reconcile {
    //! The reconciliation cache: per task id, `PendingCreation -> RemoteBacked -> (removed)`.
    //!
    //! Every handler takes a [`SyncContext`] carrying the document, the fire-and-forget remote
    //! port and the current time, and runs to completion against `&mut self`. Remote calls are
    //! only *issued* here. Their outcomes come back later through
    //! [`ReconciliationCache::on_created`], [`ReconciliationCache::on_remote_value`] and
    //! [`ReconciliationCache::on_mutation_failed`].

    use crate::codec::encode_markup_with;
    use crate::core::*;
    use crate::parser::parse_occurrences;
    use crate::snapshot::CacheSnapshot;
    use crate::surface::DocumentSurface;
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use indexmap::map::Entry;
    use serde::Serialize;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(5);

    /* ---------------------------- Remote port ---------------------------- */

    /// Fire-and-forget side of the remote store. Implementations start the work and return
    /// immediately; completions are fed back into the cache by whoever owns it.
    pub trait RemoteDispatch: Send {
        /// Start observing `id`. Values arrive via `on_remote_value` until the returned
        /// subscription is cancelled.
        fn subscribe(&mut self, id: &TaskId) -> Subscription;
        fn create(&mut self, provisional: &TaskId, draft: &Task);
        fn update_content(&mut self, id: &TaskId, content: &str);
        fn set_checked(&mut self, id: &TaskId, checked: bool);
    }

    /// Handle on a live remote subscription. Cancels its token exactly once, on
    /// [`Subscription::cancel`] or on drop.
    #[derive(Debug)]
    pub struct Subscription {
        id: TaskId,
        token: CancellationToken,
        cancelled: bool,
    }

    impl Subscription {
        pub fn new(id: TaskId, token: CancellationToken) -> Self {
            Self {
                id,
                token,
                cancelled: false,
            }
        }

        pub fn id(&self) -> &TaskId {
            &self.id
        }

        /// Returns false if it was already cancelled.
        pub fn cancel(&mut self) -> bool {
            if self.cancelled {
                return false;
            }
            self.cancelled = true;
            self.token.cancel();
            debug!(task_id = %self.id, "subscription cancelled");
            true
        }

        pub fn is_cancelled(&self) -> bool {
            self.cancelled
        }
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            self.cancel();
        }
    }

    /* ------------------------------- Entries ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PendingEntry {
        /// Latest local value seen while the create is in flight.
        pub draft: Task,
        pub requested_at: DateTime<Utc>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EchoState {
        RecentlyPushed,
        Settled,
    }

    #[derive(Debug)]
    pub struct RemoteEntry {
        /// Last value known to be applied remotely. Local edits are diffed against this.
        pub remote: Task,
        pub subscription: Subscription,
        pub last_local_edit_at: Option<DateTime<Utc>>,
    }

    impl RemoteEntry {
        fn new(remote: Task, subscription: Subscription) -> Self {
            Self {
                remote,
                subscription,
                last_local_edit_at: None,
            }
        }

        pub fn echo_state(&self, now: DateTime<Utc>, window: Duration) -> EchoState {
            let Some(stamp) = self.last_local_edit_at else {
                return EchoState::Settled;
            };
            match now.signed_duration_since(stamp).to_std() {
                Ok(elapsed) if elapsed >= window => EchoState::Settled,
                // a stamp in the future counts as recent
                _ => EchoState::RecentlyPushed,
            }
        }

        /// Local wins: issue one mutation per differing field.
        fn push_diff(
            &mut self,
            local: &Task,
            remote: &mut dyn RemoteDispatch,
            now: DateTime<Utc>,
            report: &mut PassReport,
        ) {
            let id = &self.remote.id;
            let mut pushed = false;
            if local.content != self.remote.content {
                remote.update_content(id, &local.content);
                report.content_updates += 1;
                pushed = true;
            }
            if local.checked != self.remote.checked {
                remote.set_checked(id, local.checked);
                report.checked_updates += 1;
                pushed = true;
            }
            if pushed {
                debug!(task_id = %id, "pushed local edit");
                self.remote = local.with_id(id.clone());
                self.last_local_edit_at = Some(now);
            }
        }
    }

    #[derive(Debug)]
    pub enum CacheEntry {
        PendingCreation(PendingEntry),
        RemoteBacked(RemoteEntry),
    }

    /* ------------------------------- Context ------------------------------- */

    pub struct SyncContext<'a> {
        pub document: &'a dyn DocumentSurface,
        pub remote: &'a mut dyn RemoteDispatch,
        pub now: DateTime<Utc>,
    }

    /// What one handler call did.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    pub struct PassReport {
        pub written: usize,
        pub creates: usize,
        pub subscribed: usize,
        pub content_updates: usize,
        pub checked_updates: usize,
        pub torn_down: usize,
        pub removed_lines: usize,
        pub ignored_duplicates: usize,
    }

    impl PassReport {
        /// No document writes and no remote mutations.
        pub fn is_quiet(&self) -> bool {
            self.written == 0
                && self.creates == 0
                && self.subscribed == 0
                && self.content_updates == 0
                && self.checked_updates == 0
                && self.torn_down == 0
                && self.removed_lines == 0
        }
    }

    /* -------------------------------- Cache -------------------------------- */

    #[derive(Debug)]
    pub struct ReconciliationCache {
        entries: IndexMap<TaskId, CacheEntry>,
        seeds: HashMap<TaskId, Task>,
        echo_window: Duration,
        notices: Vec<Notice>,
    }

    impl Default for ReconciliationCache {
        fn default() -> Self {
            Self::new(DEFAULT_ECHO_WINDOW)
        }
    }

    impl ReconciliationCache {
        pub fn new(echo_window: Duration) -> Self {
            Self {
                entries: IndexMap::new(),
                seeds: HashMap::new(),
                echo_window,
                notices: Vec::new(),
            }
        }

        pub fn echo_window(&self) -> Duration {
            self.echo_window
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn entry(&self, id: &TaskId) -> Option<&CacheEntry> {
            self.entries.get(id)
        }

        pub fn pending_ids(&self) -> Vec<TaskId> {
            self.entries
                .iter()
                .filter(|(_, e)| matches!(e, CacheEntry::PendingCreation(_)))
                .map(|(id, _)| id.clone())
                .collect()
        }

        pub fn remote_backed_ids(&self) -> Vec<TaskId> {
            self.entries
                .iter()
                .filter(|(_, e)| matches!(e, CacheEntry::RemoteBacked(_)))
                .map(|(id, _)| id.clone())
                .collect()
        }

        pub fn drain_notices(&mut self) -> Vec<Notice> {
            std::mem::take(&mut self.notices)
        }

        fn raise(&mut self, task_id: Option<&TaskId>, message: String, now: DateTime<Utc>) {
            warn!(task_id = ?task_id.map(TaskId::as_str), "{message}");
            self.notices.push(Notice {
                task_id: task_id.cloned(),
                message,
                raised_at: now,
            });
        }

        fn teardown(&mut self, id: &TaskId) -> bool {
            match self.entries.shift_remove(id) {
                Some(CacheEntry::RemoteBacked(mut entry)) => {
                    entry.subscription.cancel();
                    true
                }
                Some(CacheEntry::PendingCreation(_)) => true,
                None => false,
            }
        }

        /// Cancel every subscription and forget everything, seeds included.
        pub fn clear(&mut self) -> usize {
            let count = self.entries.len();
            for (_, entry) in self.entries.iter_mut() {
                if let CacheEntry::RemoteBacked(entry) = entry {
                    entry.subscription.cancel();
                }
            }
            self.entries.clear();
            self.seeds.clear();
            count
        }

        /// Last-known remote values of every remote-backed entry.
        pub fn snapshot(&self, document: &str, now: DateTime<Utc>) -> CacheSnapshot {
            let mut snapshot = CacheSnapshot::new(document, now);
            for entry in self.entries.values() {
                if let CacheEntry::RemoteBacked(entry) = entry {
                    snapshot.insert(&entry.remote);
                }
            }
            snapshot
        }

        /// Values to start from when a durable id is first seen, instead of the local text.
        /// A seed is used at most once.
        pub fn seed_from(&mut self, snapshot: &CacheSnapshot) {
            self.seeds = snapshot.tasks().map(|task| (task.id.clone(), task)).collect();
        }

        /// Read and parse the document, then reconcile it.
        pub async fn reconcile_document(
            &mut self,
            ctx: &mut SyncContext<'_>,
        ) -> Result<PassReport, SurfaceError> {
            let text = ctx.document.read().await?;
            let occurrences = parse_occurrences(&text);
            self.reconcile(&occurrences, ctx).await
        }

        pub async fn reconcile(
            &mut self,
            occurrences: &[Occurrence],
            ctx: &mut SyncContext<'_>,
        ) -> Result<PassReport, SurfaceError> {
            let mut report = PassReport::default();

            // New ids go into the text before anything refers to them.
            for occ in occurrences.iter().filter(|o| o.is_new) {
                let line = encode_markup_with(occ.bullet, &occ.task);
                ctx.document.write_span(&occ.span, &line).await?;
                report.written += 1;
            }

            let mut seen: HashMap<&TaskId, &Task> = HashMap::new();
            for occ in occurrences {
                let local = &occ.task;
                if let Some(first) = seen.get(&local.id) {
                    if !first.same_value(local) {
                        warn!(
                            task_id = %local.id,
                            line = occ.line_number,
                            "conflicting duplicate occurrence ignored"
                        );
                        report.ignored_duplicates += 1;
                    }
                    continue;
                }
                seen.insert(&local.id, local);

                match self.entries.entry(local.id.clone()) {
                    Entry::Vacant(slot) if local.id.is_provisional() => {
                        ctx.remote.create(&local.id, local);
                        slot.insert(CacheEntry::PendingCreation(PendingEntry {
                            draft: local.clone(),
                            requested_at: ctx.now,
                        }));
                        report.creates += 1;
                    }
                    Entry::Vacant(slot) => {
                        let seed = self.seeds.remove(&local.id).unwrap_or_else(|| local.clone());
                        let subscription = ctx.remote.subscribe(&local.id);
                        let mut entry = RemoteEntry::new(seed, subscription);
                        entry.push_diff(local, &mut *ctx.remote, ctx.now, &mut report);
                        slot.insert(CacheEntry::RemoteBacked(entry));
                        report.subscribed += 1;
                    }
                    Entry::Occupied(mut slot) => match slot.get_mut() {
                        CacheEntry::PendingCreation(pending) => pending.draft = local.clone(),
                        CacheEntry::RemoteBacked(entry) => {
                            entry.push_diff(local, &mut *ctx.remote, ctx.now, &mut report)
                        }
                    },
                }
            }

            let absent: Vec<TaskId> = self
                .entries
                .keys()
                .filter(|id| !seen.contains_key(id))
                .cloned()
                .collect();
            for id in absent {
                debug!(task_id = %id, "occurrence gone, tearing down");
                self.teardown(&id);
                report.torn_down += 1;
            }

            if !report.is_quiet() {
                info!(?report, "reconciled");
            }
            Ok(report)
        }

        /// Completion of a create issued for `provisional`.
        pub async fn on_created(
            &mut self,
            provisional: &TaskId,
            result: Result<Task, RemoteError>,
            ctx: &mut SyncContext<'_>,
        ) -> Result<PassReport, SurfaceError> {
            let mut report = PassReport::default();
            let pending = match self.entries.get(provisional) {
                Some(CacheEntry::PendingCreation(pending)) => pending.clone(),
                _ => {
                    debug!(task_id = %provisional, "create completed for an untracked id");
                    return Ok(report);
                }
            };
            self.entries.shift_remove(provisional);

            let created = match result {
                Ok(created) => created,
                Err(err) => {
                    let message =
                        format!("could not create task {:?}: {err}", pending.draft.content);
                    self.raise(Some(provisional), message, ctx.now);
                    return Ok(report);
                }
            };
            let elapsed_ms = (ctx.now - pending.requested_at).num_milliseconds();
            debug!(task_id = %created.id, %provisional, elapsed_ms, "task created");

            if self.entries.contains_key(&created.id) {
                let message = format!(
                    "remote id {} for {provisional} is already tracked; keeping the existing task",
                    created.id
                );
                self.raise(Some(&created.id), message, ctx.now);
                return Ok(report);
            }

            let text = ctx.document.read().await?;
            let mut local = pending.draft.with_id(created.id.clone());
            let mut first = true;
            for occ in parse_occurrences(&text)
                .into_iter()
                .filter(|o| &o.task.id == provisional)
            {
                let promoted = occ.task.with_id(created.id.clone());
                ctx.document
                    .write_span(&occ.span, &encode_markup_with(occ.bullet, &promoted))
                    .await?;
                report.written += 1;
                if first {
                    local = promoted;
                    first = false;
                }
            }

            let subscription = ctx.remote.subscribe(&created.id);
            let mut entry = RemoteEntry::new(created.clone(), subscription);
            entry.push_diff(&local, &mut *ctx.remote, ctx.now, &mut report);
            self.entries
                .insert(created.id.clone(), CacheEntry::RemoteBacked(entry));
            report.subscribed += 1;
            Ok(report)
        }

        /// A subscription observed `value` for `id`.
        pub async fn on_remote_value(
            &mut self,
            id: &TaskId,
            value: RemoteValue,
            ctx: &mut SyncContext<'_>,
        ) -> Result<PassReport, SurfaceError> {
            let mut report = PassReport::default();
            let Some(CacheEntry::RemoteBacked(entry)) = self.entries.get_mut(id) else {
                debug!(task_id = %id, "remote value for an untracked id");
                return Ok(report);
            };

            if let RemoteValue::Present(task) = &value {
                if task.same_value(&entry.remote) {
                    // the remote caught up with what we pushed
                    entry.last_local_edit_at = None;
                    return Ok(report);
                }
            }
            if entry.echo_state(ctx.now, self.echo_window) == EchoState::RecentlyPushed {
                debug!(task_id = %id, "remote value suppressed inside echo window");
                return Ok(report);
            }
            entry.last_local_edit_at = None;

            match value {
                RemoteValue::Deleted => {
                    info!(task_id = %id, "task deleted remotely, removing its lines");
                    self.teardown(id);
                    report.torn_down += 1;
                    let text = ctx.document.read().await?;
                    let mut lines: Vec<usize> = parse_occurrences(&text)
                        .into_iter()
                        .filter(|o| &o.task.id == id)
                        .map(|o| o.span.line)
                        .collect();
                    lines.dedup();
                    for line in lines.into_iter().rev() {
                        ctx.document.remove_line(line).await?;
                        report.removed_lines += 1;
                    }
                }
                RemoteValue::Present(task) => {
                    entry.remote = task.with_id(id.clone());
                    let text = ctx.document.read().await?;
                    for occ in parse_occurrences(&text)
                        .into_iter()
                        .filter(|o| &o.task.id == id && !o.task.same_value(&task))
                    {
                        let updated = task.with_id(id.clone());
                        ctx.document
                            .write_span(&occ.span, &encode_markup_with(occ.bullet, &updated))
                            .await?;
                        report.written += 1;
                    }
                    if report.written > 0 {
                        info!(task_id = %id, lines = report.written, "applied remote change");
                    }
                }
            }
            Ok(report)
        }

        /// A content or checked mutation failed for good.
        pub fn on_mutation_failed(&mut self, id: &TaskId, error: RemoteError, now: DateTime<Utc>) {
            if !self.teardown(id) {
                debug!(task_id = %id, %error, "failure for an untracked id");
                return;
            }
            self.raise(Some(id), format!("sync failed for task {id}: {error}"), now);
        }
    }

}

pub mod snapshot {
    //! Last-known remote values persisted between runs, keyed by task id.

    use crate::core::{Task, TaskId};
    use anyhow::{Context, Result};
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tracing::{debug, info, warn};

    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskValue {
        pub content: String,
        pub checked: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CacheSnapshot {
        pub saved_at: DateTime<Utc>,
        /// Key of the document the values belong to.
        pub document: String,
        #[serde(default)]
        pub tasks: IndexMap<TaskId, TaskValue>,
    }

    impl CacheSnapshot {
        pub fn new(document: impl Into<String>, saved_at: DateTime<Utc>) -> Self {
            Self {
                saved_at,
                document: document.into(),
                tasks: IndexMap::new(),
            }
        }

        pub fn insert(&mut self, task: &Task) {
            self.tasks.insert(
                task.id.clone(),
                TaskValue {
                    content: task.content.clone(),
                    checked: task.checked,
                },
            );
        }

        pub fn tasks(&self) -> impl Iterator<Item = Task> + '_ {
            self.tasks
                .iter()
                .map(|(id, value)| Task::new(id.clone(), value.content.clone(), value.checked))
        }

        pub fn len(&self) -> usize {
            self.tasks.len()
        }

        pub fn is_empty(&self) -> bool {
            self.tasks.is_empty()
        }

        /// A snapshot from the future is treated as fresh.
        pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
            match now.signed_duration_since(self.saved_at).to_std() {
                Ok(age) => age > max_age,
                Err(_) => false,
            }
        }

        pub fn save(&self, path: &Path) -> Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating snapshot directory {:?}", parent))?;
            }
            let json = serde_json::to_string_pretty(self).context("serializing snapshot")?;
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json).with_context(|| format!("writing {:?}", tmp))?;
            fs::rename(&tmp, path).with_context(|| format!("replacing {:?}", path))?;
            debug!(path = %path.display(), tasks = self.len(), "snapshot saved");
            Ok(())
        }

        /// `None` when there is nothing trustworthy to resume from.
        pub fn load(
            path: &Path,
            document: &str,
            max_age: Duration,
            now: DateTime<Utc>,
        ) -> Option<Self> {
            let raw = match fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
                Err(err) => {
                    warn!(path = %path.display(), %err, "snapshot unreadable, ignoring");
                    return None;
                }
            };
            let snapshot: CacheSnapshot = match serde_json::from_str(&raw) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(path = %path.display(), %err, "snapshot corrupt, ignoring");
                    return None;
                }
            };
            if snapshot.document != document {
                debug!(path = %path.display(), other = %snapshot.document, "foreign snapshot");
                return None;
            }
            if snapshot.is_stale(max_age, now) {
                info!(path = %path.display(), saved_at = %snapshot.saved_at, "stale snapshot");
                return None;
            }
            Some(snapshot)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::TimeZone;

        fn now() -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
        }

        fn sample() -> CacheSnapshot {
            let mut snapshot = CacheSnapshot::new("notes/today.md", now());
            snapshot.insert(&Task::new(TaskId::from("T1"), "Buy milk", false));
            snapshot.insert(&Task::new(TaskId::from("T2"), "Call mom", true));
            snapshot
        }

        #[test]
        fn saved_snapshot_loads_back() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("state").join("snapshot.json");
            sample().save(&path).expect("save");

            let loaded = CacheSnapshot::load(&path, "notes/today.md", DEFAULT_MAX_AGE, now())
                .expect("fresh snapshot");
            assert_eq!(loaded, sample());
            let ids: Vec<TaskId> = loaded.tasks().map(|t| t.id).collect();
            assert_eq!(ids, vec![TaskId::from("T1"), TaskId::from("T2")]);
        }

        #[test]
        fn stale_foreign_or_corrupt_snapshots_are_discarded() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("snapshot.json");
            assert!(CacheSnapshot::load(&path, "notes/today.md", DEFAULT_MAX_AGE, now()).is_none());

            sample().save(&path).expect("save");
            let later = now() + chrono::Duration::hours(25);
            assert!(CacheSnapshot::load(&path, "notes/today.md", DEFAULT_MAX_AGE, later).is_none());
            assert!(CacheSnapshot::load(&path, "notes/other.md", DEFAULT_MAX_AGE, now()).is_none());

            fs::write(&path, "{ not json").expect("write");
            assert!(CacheSnapshot::load(&path, "notes/today.md", DEFAULT_MAX_AGE, now()).is_none());
        }

        #[test]
        fn staleness_boundary() {
            let snapshot = sample();
            let max_age = Duration::from_secs(60);
            assert!(!snapshot.is_stale(max_age, now() + chrono::Duration::seconds(60)));
            assert!(snapshot.is_stale(max_age, now() + chrono::Duration::seconds(61)));
            assert!(!snapshot.is_stale(max_age, now() - chrono::Duration::seconds(30)));
        }
    }
}

pub mod config {
    //! TOML configuration. Every field has a default so an empty or missing file is valid.

    use crate::reconcile::DEFAULT_ECHO_WINDOW;
    use crate::remote::{DEFAULT_API_URL, DEFAULT_SYNC_URL, RetryPolicy};
    use crate::snapshot::DEFAULT_MAX_AGE;
    use serde::Deserialize;
    use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tracing::debug;

    pub const CONFIG_ENV: &str = "TODOSYNC_CONFIG";
    pub const TOKEN_ENV: &str = "TODOSYNC_API_TOKEN";

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("cannot read config {path:?}: {source}")]
        Read {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid config {path:?}: {source}")]
        Parse {
            path: PathBuf,
            #[source]
            source: toml::de::Error,
        },
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct RetryConfig {
        pub max_attempts: u32,
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        #[serde(rename = "base_delay_ms")]
        pub base_delay: Duration,
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        #[serde(rename = "max_delay_ms")]
        pub max_delay: Duration,
    }

    impl Default for RetryConfig {
        fn default() -> Self {
            let policy = RetryPolicy::default();
            Self {
                max_attempts: policy.max_attempts,
                base_delay: policy.base_delay,
                max_delay: policy.max_delay,
            }
        }
    }

    impl From<&RetryConfig> for RetryPolicy {
        fn from(config: &RetryConfig) -> Self {
            RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                base_delay: config.base_delay,
                max_delay: config.max_delay.max(config.base_delay),
            }
        }
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct SyncConfig {
        pub api_token: Option<String>,
        pub api_url: String,
        pub sync_url: String,
        /// Project new tasks are created in; the account inbox when unset.
        pub project_id: Option<String>,
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        #[serde(rename = "debounce_ms")]
        pub debounce: Duration,
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        #[serde(rename = "echo_window_ms")]
        pub echo_window: Duration,
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        #[serde(rename = "poll_interval_ms")]
        pub poll_interval: Duration,
        pub snapshot_path: Option<PathBuf>,
        #[serde_as(as = "DurationSeconds<u64>")]
        #[serde(rename = "snapshot_max_age_secs")]
        pub snapshot_max_age: Duration,
        pub retry: RetryConfig,
    }

    impl Default for SyncConfig {
        fn default() -> Self {
            Self {
                api_token: None,
                api_url: DEFAULT_API_URL.to_string(),
                sync_url: DEFAULT_SYNC_URL.to_string(),
                project_id: None,
                debounce: Duration::from_millis(1000),
                echo_window: DEFAULT_ECHO_WINDOW,
                poll_interval: Duration::from_secs(15),
                snapshot_path: None,
                snapshot_max_age: DEFAULT_MAX_AGE,
                retry: RetryConfig::default(),
            }
        }
    }

    impl SyncConfig {
        pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
            toml::from_str(raw)
        }

        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
        }

        /// An explicit path must exist; the default location may be absent.
        pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
            if let Some(path) = explicit {
                return Self::load(path);
            }
            match default_path() {
                Some(path) if path.is_file() => Self::load(&path),
                _ => {
                    debug!("no config file, using defaults");
                    Ok(Self::default())
                }
            }
        }

        pub fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::from(&self.retry)
        }

        /// Configured snapshot path, or a hidden file next to the document.
        pub fn snapshot_path_for(&self, document: &Path) -> PathBuf {
            if let Some(path) = &self.snapshot_path {
                return path.clone();
            }
            let name = document
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            document.with_file_name(format!(".{name}.todosync.json"))
        }
    }

    /// `$XDG_CONFIG_HOME/todosync/config.toml`, falling back to `~/.config`.
    pub fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(base.join("todosync").join("config.toml"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn empty_file_gives_defaults() {
            let config = SyncConfig::from_toml_str("").expect("parse");
            assert_eq!(config, SyncConfig::default());
            assert_eq!(config.debounce, Duration::from_secs(1));
            assert_eq!(config.echo_window, Duration::from_secs(5));
            assert_eq!(config.snapshot_max_age, Duration::from_secs(86_400));
        }

        #[test]
        fn durations_and_nested_retry_are_read() {
            let config = SyncConfig::from_toml_str(
                r#"
                api_token = "secret"
                project_id = "2203306141"
                debounce_ms = 250
                echo_window_ms = 8000
                poll_interval_ms = 30000
                snapshot_max_age_secs = 3600

                [retry]
                max_attempts = 6
                base_delay_ms = 100
                "#,
            )
            .expect("parse");
            assert_eq!(config.api_token.as_deref(), Some("secret"));
            assert_eq!(config.debounce, Duration::from_millis(250));
            assert_eq!(config.echo_window, Duration::from_secs(8));
            assert_eq!(config.poll_interval, Duration::from_secs(30));
            assert_eq!(config.snapshot_max_age, Duration::from_secs(3600));
            let policy = config.retry_policy();
            assert_eq!(policy.max_attempts, 6);
            assert_eq!(policy.base_delay, Duration::from_millis(100));
            assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
        }

        #[test]
        fn unknown_keys_are_rejected() {
            assert!(SyncConfig::from_toml_str("debounce = 5").is_err());
        }

        #[test]
        fn load_reports_the_path() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("config.toml");
            std::fs::write(&path, "echo_window_ms = \"soon\"").expect("write");
            let err = SyncConfig::load(&path).unwrap_err();
            assert!(matches!(err, ConfigError::Parse { .. }));
            assert!(err.to_string().contains("config.toml"));

            let missing = tmp.path().join("missing.toml");
            assert!(matches!(
                SyncConfig::load_or_default(Some(&missing)),
                Err(ConfigError::Read { .. })
            ));
        }

        #[test]
        fn snapshot_lives_next_to_the_document_by_default() {
            let config = SyncConfig::default();
            assert_eq!(
                config.snapshot_path_for(Path::new("/notes/today.md")),
                PathBuf::from("/notes/.today.md.todosync.json")
            );
            let config = SyncConfig {
                snapshot_path: Some(PathBuf::from("/var/state.json")),
                ..SyncConfig::default()
            };
            assert_eq!(
                config.snapshot_path_for(Path::new("/notes/today.md")),
                PathBuf::from("/var/state.json")
            );
        }
    }
}

pub mod session {
    //! Event-driven session: one coordinator owns the [`SessionState`] and handles
    //! [`SyncEvent`]s one at a time, so reconciliation never re-enters itself.
    //!
    //! Remote work runs on spawned tokio tasks ([`TaskDispatcher`]) whose completions come back
    //! through the same channel, tagged with the epoch that issued them. Epochs advance on
    //! document switch, close and sync toggle; anything from an older epoch is dropped.

    use crate::codec::NewTaskPayload;
    use crate::config::SyncConfig;
    use crate::core::*;
    use crate::reconcile::{
        PassReport, ReconciliationCache, RemoteDispatch, Subscription, SyncContext,
    };
    use crate::remote::RemoteTaskStore;
    use crate::snapshot::CacheSnapshot;
    use crate::surface::DocumentSurface;
    use anyhow::{Context, Result};
    use chrono::Utc;
    use std::future::Future;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::{Instant, MissedTickBehavior};
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    pub type Epoch = u64;

    /* ------------------------------- Events ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RemoteEvent {
        Created {
            provisional: TaskId,
            result: Result<Task, RemoteError>,
        },
        MutationFailed {
            id: TaskId,
            error: RemoteError,
        },
        Value {
            id: TaskId,
            value: RemoteValue,
        },
    }

    pub enum SyncEvent {
        DocumentOpened {
            key: String,
            surface: Arc<dyn DocumentSurface>,
        },
        /// A keystroke-level change; coalesced by the debouncer.
        DocumentEdited,
        /// The file changed underneath us (no live editor).
        ExternalModify,
        ViewChanged,
        /// The debounce window elapsed.
        Reparse { epoch: Epoch },
        SyncToggled(bool),
        DocumentClosed,
        Remote { epoch: Epoch, event: RemoteEvent },
        Shutdown,
    }

    impl SyncEvent {
        pub fn kind(&self) -> &'static str {
            match self {
                SyncEvent::DocumentOpened { .. } => "document-opened",
                SyncEvent::DocumentEdited => "document-edited",
                SyncEvent::ExternalModify => "external-modify",
                SyncEvent::ViewChanged => "view-changed",
                SyncEvent::Reparse { .. } => "reparse",
                SyncEvent::SyncToggled(_) => "sync-toggled",
                SyncEvent::DocumentClosed => "document-closed",
                SyncEvent::Remote { .. } => "remote",
                SyncEvent::Shutdown => "shutdown",
            }
        }
    }

    async fn or_cancel<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = token.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Counts outstanding remote work until dropped.
    struct InFlight(Arc<AtomicUsize>);

    impl InFlight {
        fn start(counter: &Arc<AtomicUsize>) -> Self {
            counter.fetch_add(1, Ordering::SeqCst);
            Self(counter.clone())
        }
    }

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /* ------------------------------ Debouncer ------------------------------ */

    /// Cancellable delayed `Reparse`. Scheduling again restarts the timer.
    pub struct Debouncer {
        delay: Duration,
        pending: Option<(CancellationToken, JoinHandle<()>)>,
    }

    impl Debouncer {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                pending: None,
            }
        }

        pub fn schedule(&mut self, events: &mpsc::UnboundedSender<SyncEvent>, epoch: Epoch) {
            self.cancel();
            let token = CancellationToken::new();
            let child = token.clone();
            let events = events.clone();
            let delay = self.delay;
            let handle = tokio::spawn(async move {
                if or_cancel(&child, tokio::time::sleep(delay)).await.is_some() {
                    let _ = events.send(SyncEvent::Reparse { epoch });
                }
            });
            self.pending = Some((token, handle));
        }

        /// Returns true if a timer was still running.
        pub fn cancel(&mut self) -> bool {
            match self.pending.take() {
                Some((token, handle)) => {
                    let live = !handle.is_finished();
                    token.cancel();
                    live
                }
                None => false,
            }
        }

        pub fn is_pending(&self) -> bool {
            self.pending
                .as_ref()
                .is_some_and(|(_, handle)| !handle.is_finished())
        }
    }

    impl Drop for Debouncer {
        fn drop(&mut self) {
            self.cancel();
        }
    }

    /* ------------------------------ Dispatcher ------------------------------ */

    /// [`RemoteDispatch`] backed by a [`RemoteTaskStore`] and spawned tokio tasks.
    pub struct TaskDispatcher {
        store: Arc<dyn RemoteTaskStore>,
        events: mpsc::UnboundedSender<SyncEvent>,
        epoch: Epoch,
        poll_interval: Duration,
        project_id: Option<String>,
        in_flight: Arc<AtomicUsize>,
    }

    impl TaskDispatcher {
        pub fn new(
            store: Arc<dyn RemoteTaskStore>,
            events: mpsc::UnboundedSender<SyncEvent>,
            poll_interval: Duration,
            project_id: Option<String>,
        ) -> Self {
            Self {
                store,
                events,
                epoch: 0,
                // tokio intervals reject a zero period
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                project_id,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn set_epoch(&mut self, epoch: Epoch) {
            self.epoch = epoch;
        }

        /// One-shot calls not yet reported, plus subscriptions awaiting their first poll.
        pub fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }

        fn spawn_call<F>(&self, call: F)
        where
            F: Future<Output = Option<RemoteEvent>> + Send + 'static,
        {
            let guard = InFlight::start(&self.in_flight);
            let events = self.events.clone();
            let epoch = self.epoch;
            tokio::spawn(async move {
                if let Some(event) = call.await {
                    let _ = events.send(SyncEvent::Remote { epoch, event });
                }
                drop(guard);
            });
        }
    }

    impl RemoteDispatch for TaskDispatcher {
        fn subscribe(&mut self, id: &TaskId) -> Subscription {
            let token = CancellationToken::new();
            let child = token.clone();
            let store = self.store.clone();
            let events = self.events.clone();
            let epoch = self.epoch;
            let period = self.poll_interval;
            let task_id = id.clone();
            let mut first_poll = Some(InFlight::start(&self.in_flight));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    if or_cancel(&child, ticker.tick()).await.is_none() {
                        break;
                    }
                    let Some(result) = or_cancel(&child, store.get_task(&task_id)).await else {
                        break;
                    };
                    let (event, terminal) = match result {
                        Ok(value) => {
                            let id = task_id.clone();
                            (RemoteEvent::Value { id, value }, false)
                        }
                        Err(error) => {
                            let id = task_id.clone();
                            (RemoteEvent::MutationFailed { id, error }, true)
                        }
                    };
                    if events.send(SyncEvent::Remote { epoch, event }).is_err() || terminal {
                        break;
                    }
                    first_poll.take();
                }
                debug!(task_id = %task_id, "poll loop stopped");
            });
            Subscription::new(id.clone(), token)
        }

        fn create(&mut self, provisional: &TaskId, draft: &Task) {
            let store = self.store.clone();
            let payload = NewTaskPayload::from_task(draft, self.project_id.clone());
            let provisional = provisional.clone();
            self.spawn_call(async move {
                let result = store.create_task(&payload).await;
                Some(RemoteEvent::Created {
                    provisional,
                    result,
                })
            });
        }

        fn update_content(&mut self, id: &TaskId, content: &str) {
            let store = self.store.clone();
            let id = id.clone();
            let content = content.to_string();
            self.spawn_call(async move {
                match store.update_content(&id, &content).await {
                    Ok(_) => None,
                    Err(error) => Some(RemoteEvent::MutationFailed { id, error }),
                }
            });
        }

        fn set_checked(&mut self, id: &TaskId, checked: bool) {
            let store = self.store.clone();
            let id = id.clone();
            self.spawn_call(async move {
                match store.set_checked(&id, checked).await {
                    Ok(_) => None,
                    Err(error) => Some(RemoteEvent::MutationFailed { id, error }),
                }
            });
        }
    }

    /* ------------------------------- Session ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SessionOptions {
        pub debounce: Duration,
        pub echo_window: Duration,
        pub poll_interval: Duration,
        pub project_id: Option<String>,
        pub snapshot_path: Option<PathBuf>,
        pub snapshot_max_age: Duration,
        pub sync_enabled: bool,
    }

    impl Default for SessionOptions {
        fn default() -> Self {
            Self::from_config(&SyncConfig::default())
        }
    }

    impl SessionOptions {
        /// The snapshot path is document specific and left for the caller.
        pub fn from_config(config: &SyncConfig) -> Self {
            Self {
                debounce: config.debounce,
                echo_window: config.echo_window,
                poll_interval: config.poll_interval,
                project_id: config.project_id.clone(),
                snapshot_path: None,
                snapshot_max_age: config.snapshot_max_age,
                sync_enabled: true,
            }
        }
    }

    pub struct ActiveDocument {
        pub key: String,
        pub surface: Arc<dyn DocumentSurface>,
    }

    pub struct SessionState {
        pub active: Option<ActiveDocument>,
        pub sync_enabled: bool,
        pub cache: ReconciliationCache,
        pub epoch: Epoch,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Flow {
        Continue,
        Stop,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("sync session has shut down")]
    pub struct SessionClosed;

    /// Cloneable sender for feeding a [`Coordinator`].
    #[derive(Clone)]
    pub struct SessionHandle {
        events: mpsc::UnboundedSender<SyncEvent>,
    }

    impl SessionHandle {
        pub fn send(&self, event: SyncEvent) -> Result<(), SessionClosed> {
            self.events.send(event).map_err(|_| SessionClosed)
        }

        pub fn open(
            &self,
            key: impl Into<String>,
            surface: Arc<dyn DocumentSurface>,
        ) -> Result<(), SessionClosed> {
            self.send(SyncEvent::DocumentOpened {
                key: key.into(),
                surface,
            })
        }

        pub fn edited(&self) -> Result<(), SessionClosed> {
            self.send(SyncEvent::DocumentEdited)
        }

        pub fn external_modify(&self) -> Result<(), SessionClosed> {
            self.send(SyncEvent::ExternalModify)
        }

        pub fn view_changed(&self) -> Result<(), SessionClosed> {
            self.send(SyncEvent::ViewChanged)
        }

        pub fn set_sync_enabled(&self, enabled: bool) -> Result<(), SessionClosed> {
            self.send(SyncEvent::SyncToggled(enabled))
        }

        pub fn close(&self) -> Result<(), SessionClosed> {
            self.send(SyncEvent::DocumentClosed)
        }

        pub fn shutdown(&self) -> Result<(), SessionClosed> {
            self.send(SyncEvent::Shutdown)
        }
    }

    pub struct Coordinator {
        state: SessionState,
        dispatcher: TaskDispatcher,
        debouncer: Debouncer,
        options: SessionOptions,
        events_tx: mpsc::UnboundedSender<SyncEvent>,
        events_rx: mpsc::UnboundedReceiver<SyncEvent>,
        notice_sink: Option<mpsc::UnboundedSender<Notice>>,
    }

    impl Coordinator {
        pub fn new(store: Arc<dyn RemoteTaskStore>, options: SessionOptions) -> Self {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let dispatcher = TaskDispatcher::new(
                store,
                events_tx.clone(),
                options.poll_interval,
                options.project_id.clone(),
            );
            Self {
                state: SessionState {
                    active: None,
                    sync_enabled: options.sync_enabled,
                    cache: ReconciliationCache::new(options.echo_window),
                    epoch: 0,
                },
                dispatcher,
                debouncer: Debouncer::new(options.debounce),
                options,
                events_tx,
                events_rx,
                notice_sink: None,
            }
        }

        /// Notices are also logged; the sink is for showing them to a user.
        pub fn with_notice_sink(mut self, sink: mpsc::UnboundedSender<Notice>) -> Self {
            self.notice_sink = Some(sink);
            self
        }

        pub fn handle(&self) -> SessionHandle {
            SessionHandle {
                events: self.events_tx.clone(),
            }
        }

        pub fn state(&self) -> &SessionState {
            &self.state
        }

        /// Handle events until `Shutdown`.
        pub async fn run(mut self) -> SessionState {
            while let Some(event) = self.events_rx.recv().await {
                if self.handle_logged(event).await == Flow::Stop {
                    break;
                }
            }
            self.state
        }

        /// Handle events for `duration`, then return.
        pub async fn run_for(&mut self, duration: Duration) -> Flow {
            let deadline = Instant::now() + duration;
            while let Ok(Some(event)) =
                tokio::time::timeout_at(deadline, self.events_rx.recv()).await
            {
                if self.handle_logged(event).await == Flow::Stop {
                    return Flow::Stop;
                }
            }
            Flow::Continue
        }

        /// Handle events until nothing arrived for `quiet` while no remote call or
        /// debounce timer is outstanding.
        pub async fn run_until_idle(&mut self, quiet: Duration) -> Flow {
            loop {
                match tokio::time::timeout(quiet, self.events_rx.recv()).await {
                    Ok(Some(event)) => {
                        if self.handle_logged(event).await == Flow::Stop {
                            return Flow::Stop;
                        }
                    }
                    Ok(None) => return Flow::Stop,
                    Err(_) => {
                        if self.dispatcher.in_flight() == 0 && !self.debouncer.is_pending() {
                            return Flow::Continue;
                        }
                    }
                }
            }
        }

        async fn handle_logged(&mut self, event: SyncEvent) -> Flow {
            let kind = event.kind();
            match self.handle_event(event).await {
                Ok(flow) => flow,
                Err(err) => {
                    warn!(event = kind, "{err:#}");
                    Flow::Continue
                }
            }
        }

        pub async fn handle_event(&mut self, event: SyncEvent) -> Result<Flow> {
            debug!(event = event.kind(), epoch = self.state.epoch, "handling event");
            let flow = match event {
                SyncEvent::DocumentOpened { key, surface } => {
                    self.open(key, surface).await?;
                    Flow::Continue
                }
                SyncEvent::DocumentEdited => {
                    if self.is_syncing() {
                        self.debouncer.schedule(&self.events_tx, self.state.epoch);
                    }
                    Flow::Continue
                }
                SyncEvent::ExternalModify | SyncEvent::ViewChanged => {
                    self.debouncer.cancel();
                    self.reconcile_active().await?;
                    Flow::Continue
                }
                SyncEvent::Reparse { epoch } => {
                    if epoch == self.state.epoch {
                        self.reconcile_active().await?;
                    }
                    Flow::Continue
                }
                SyncEvent::SyncToggled(enabled) => {
                    self.set_sync_enabled(enabled).await?;
                    Flow::Continue
                }
                SyncEvent::DocumentClosed => {
                    self.close_active();
                    Flow::Continue
                }
                SyncEvent::Remote { epoch, event } => {
                    self.apply_remote(epoch, event).await?;
                    Flow::Continue
                }
                SyncEvent::Shutdown => {
                    self.close_active();
                    info!("session shut down");
                    Flow::Stop
                }
            };
            self.flush_notices();
            Ok(flow)
        }

        fn is_syncing(&self) -> bool {
            self.state.sync_enabled && self.state.active.is_some()
        }

        fn advance_epoch(&mut self) {
            self.state.epoch += 1;
            self.dispatcher.set_epoch(self.state.epoch);
        }

        fn flush_notices(&mut self) {
            for notice in self.state.cache.drain_notices() {
                if let Some(sink) = &self.notice_sink {
                    let _ = sink.send(notice);
                }
            }
        }

        async fn reconcile_active(&mut self) -> Result<PassReport> {
            if !self.state.sync_enabled {
                return Ok(PassReport::default());
            }
            let Some(active) = &self.state.active else {
                return Ok(PassReport::default());
            };
            let surface = active.surface.clone();
            let key = active.key.clone();
            let mut ctx = SyncContext {
                document: surface.as_ref(),
                remote: &mut self.dispatcher,
                now: Utc::now(),
            };
            self.state
                .cache
                .reconcile_document(&mut ctx)
                .await
                .with_context(|| format!("reconciling {key}"))
        }

        async fn open(&mut self, key: String, surface: Arc<dyn DocumentSurface>) -> Result<()> {
            self.close_active();
            info!(document = %key, "document opened");
            if let Some(path) = &self.options.snapshot_path {
                if let Some(snapshot) =
                    CacheSnapshot::load(path, &key, self.options.snapshot_max_age, Utc::now())
                {
                    debug!(tasks = snapshot.len(), "seeding from snapshot");
                    self.state.cache.seed_from(&snapshot);
                }
            }
            self.state.active = Some(ActiveDocument { key, surface });
            self.reconcile_active().await?;
            Ok(())
        }

        fn save_snapshot(&self) {
            let (Some(path), Some(active)) = (&self.options.snapshot_path, &self.state.active)
            else {
                return;
            };
            if !self.state.sync_enabled {
                return;
            }
            let snapshot = self.state.cache.snapshot(&active.key, Utc::now());
            if let Err(err) = snapshot.save(path) {
                warn!(path = %path.display(), "{err:#}");
            }
        }

        /// Save, then tear down every subscription of the active document.
        fn close_active(&mut self) {
            self.debouncer.cancel();
            self.save_snapshot();
            if let Some(active) = self.state.active.take() {
                let dropped = self.state.cache.clear();
                self.advance_epoch();
                info!(document = %active.key, dropped, "document closed");
            }
        }

        async fn set_sync_enabled(&mut self, enabled: bool) -> Result<()> {
            if enabled == self.state.sync_enabled {
                return Ok(());
            }
            if enabled {
                self.state.sync_enabled = true;
                info!("sync enabled");
                self.reconcile_active().await?;
            } else {
                self.debouncer.cancel();
                self.save_snapshot();
                self.state.sync_enabled = false;
                let dropped = self.state.cache.clear();
                self.advance_epoch();
                info!(dropped, "sync disabled");
            }
            Ok(())
        }

        async fn apply_remote(&mut self, epoch: Epoch, event: RemoteEvent) -> Result<()> {
            if epoch != self.state.epoch {
                debug!(
                    epoch,
                    current = self.state.epoch,
                    "dropping completion from an earlier epoch"
                );
                return Ok(());
            }
            let Some(active) = &self.state.active else {
                return Ok(());
            };
            let surface = active.surface.clone();
            let now = Utc::now();
            let cache = &mut self.state.cache;
            let mut ctx = SyncContext {
                document: surface.as_ref(),
                remote: &mut self.dispatcher,
                now,
            };
            match event {
                RemoteEvent::Created {
                    provisional,
                    result,
                } => {
                    cache.on_created(&provisional, result, &mut ctx).await?;
                }
                RemoteEvent::Value { id, value } => {
                    cache.on_remote_value(&id, value, &mut ctx).await?;
                }
                RemoteEvent::MutationFailed { id, error } => {
                    cache.on_mutation_failed(&id, error, now);
                }
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::remote::InMemoryTaskStore;
        use crate::surface::BufferSurface;

        const QUIET: Duration = Duration::from_millis(60);

        fn options() -> SessionOptions {
            SessionOptions {
                debounce: Duration::from_millis(20),
                poll_interval: Duration::from_secs(3600),
                ..SessionOptions::default()
            }
        }

        fn tid(id: &str) -> TaskId {
            TaskId::from(id)
        }

        #[tokio::test]
        async fn new_tasks_are_created_and_written_back() {
            let store = Arc::new(InMemoryTaskStore::new());
            let mut coordinator = Coordinator::new(store.clone(), options());
            let doc = Arc::new(BufferSurface::new("- [ ] Task 1\n- [x] Task 2\n"));

            coordinator.handle().open("today.md", doc.clone()).unwrap();
            coordinator.run_until_idle(QUIET).await;

            assert_eq!(
                doc.text(),
                "- [ ] Task 1 %%[tid:: T1]%%\n- [x] Task 2 %%[tid:: T2]%%\n"
            );
            assert_eq!(store.task(&tid("T2")), Some(Task::new(tid("T2"), "Task 2", true)));
            assert_eq!(coordinator.state().cache.remote_backed_ids().len(), 2);
        }

        #[tokio::test]
        async fn remote_edits_are_polled_into_the_document() {
            let store = Arc::new(InMemoryTaskStore::with_tasks([Task::new(tid("T1"), "a", false)]));
            let mut coordinator = Coordinator::new(
                store.clone(),
                SessionOptions {
                    poll_interval: Duration::from_millis(20),
                    ..options()
                },
            );
            let doc = Arc::new(BufferSurface::new("- [ ] a %%[tid:: T1]%%\n"));
            coordinator.handle().open("today.md", doc.clone()).unwrap();
            coordinator.run_for(Duration::from_millis(60)).await;

            store.edit_remote(&tid("T1"), "a from phone", true);
            coordinator.run_for(Duration::from_millis(150)).await;
            assert_eq!(doc.text(), "- [x] a from phone %%[tid:: T1]%%\n");

            store.delete_remote(&tid("T1"));
            coordinator.run_for(Duration::from_millis(150)).await;
            assert_eq!(doc.text(), "");
            assert!(coordinator.state().cache.is_empty());
        }

        #[tokio::test]
        async fn disabling_sync_stops_write_backs() {
            let store = Arc::new(InMemoryTaskStore::with_tasks([Task::new(tid("T1"), "a", false)]));
            let mut coordinator = Coordinator::new(
                store.clone(),
                SessionOptions {
                    poll_interval: Duration::from_millis(20),
                    ..options()
                },
            );
            let handle = coordinator.handle();
            let doc = Arc::new(BufferSurface::new("- [ ] a %%[tid:: T1]%%\n"));
            handle.open("today.md", doc.clone()).unwrap();
            coordinator.run_for(Duration::from_millis(50)).await;
            assert_eq!(coordinator.state().cache.len(), 1);

            handle.set_sync_enabled(false).unwrap();
            coordinator.run_for(Duration::from_millis(20)).await;
            assert!(coordinator.state().cache.is_empty());

            store.edit_remote(&tid("T1"), "changed elsewhere", true);
            coordinator.run_for(Duration::from_millis(120)).await;
            assert_eq!(doc.text(), "- [ ] a %%[tid:: T1]%%\n");
        }

        #[tokio::test]
        async fn completions_from_a_previous_document_are_dropped() {
            let store = Arc::new(InMemoryTaskStore::with_tasks([Task::new(tid("T7"), "b", false)]));
            let mut coordinator = Coordinator::new(store.clone(), options());
            let handle = coordinator.handle();
            let first = Arc::new(BufferSurface::new("- [ ] a\n"));
            let second = Arc::new(BufferSurface::new("- [ ] b %%[tid:: T7]%%\n"));

            handle.open("a.md", first.clone()).unwrap();
            handle.open("b.md", second.clone()).unwrap();
            coordinator.run_until_idle(QUIET).await;

            // the create went through remotely, but the first document is no longer active
            assert_eq!(store.len(), 2);
            assert!(first.text().contains("%%[tid:: local-"));
            assert_eq!(second.text(), "- [ ] b %%[tid:: T7]%%\n");
            let active = coordinator.state().active.as_ref().map(|a| a.key.clone());
            assert_eq!(active.as_deref(), Some("b.md"));
            assert_eq!(coordinator.state().cache.remote_backed_ids(), vec![tid("T7")]);
        }

        #[tokio::test]
        async fn snapshot_carries_offline_edits_across_restarts() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let snapshot_path = tmp.path().join("snapshot.json");
            let store =
                Arc::new(InMemoryTaskStore::with_tasks([Task::new(tid("T1"), "milk", false)]));
            let opts = SessionOptions {
                snapshot_path: Some(snapshot_path.clone()),
                ..options()
            };
            let doc = Arc::new(BufferSurface::new("- [ ] milk %%[tid:: T1]%%\n"));

            let mut coordinator = Coordinator::new(store.clone(), opts.clone());
            coordinator.handle().open("list.md", doc.clone()).unwrap();
            coordinator.handle().shutdown().unwrap();
            assert_eq!(coordinator.run_until_idle(QUIET).await, Flow::Stop);
            assert!(snapshot_path.is_file());

            doc.set_text("- [ ] oat milk %%[tid:: T1]%%\n");
            let mut coordinator = Coordinator::new(store.clone(), opts);
            coordinator.handle().open("list.md", doc.clone()).unwrap();
            coordinator.run_until_idle(QUIET).await;

            assert_eq!(store.task(&tid("T1")).map(|t| t.content), Some("oat milk".to_string()));
            assert_eq!(doc.text(), "- [ ] oat milk %%[tid:: T1]%%\n");
        }

        #[tokio::test]
        async fn failed_create_reaches_the_notice_sink() {
            let store = Arc::new(InMemoryTaskStore::new());
            store.fail_next(RemoteError::Validation("content too long".into()));
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut coordinator = Coordinator::new(store.clone(), options()).with_notice_sink(tx);
            let doc = Arc::new(BufferSurface::new("- [ ] x\n"));

            coordinator.handle().open("today.md", doc.clone()).unwrap();
            coordinator.run_until_idle(QUIET).await;

            let notice = rx.try_recv().expect("notice");
            assert!(notice.message.contains("content too long"));
            assert!(coordinator.state().cache.is_empty());
            assert!(store.is_empty());
            assert!(doc.text().contains("%%[tid:: local-"));
        }

        #[tokio::test]
        async fn edits_are_debounced_into_one_pass() {
            let store = Arc::new(InMemoryTaskStore::new());
            let mut coordinator = Coordinator::new(store.clone(), options());
            let handle = coordinator.handle();
            let doc = Arc::new(BufferSurface::new(""));
            handle.open("today.md", doc.clone()).unwrap();
            coordinator.run_until_idle(QUIET).await;

            doc.set_text("- [ ] typed\n");
            for _ in 0..5 {
                handle.edited().unwrap();
            }
            coordinator.run_until_idle(QUIET).await;

            assert_eq!(store.len(), 1);
            assert_eq!(doc.text(), "- [ ] typed %%[tid:: T1]%%\n");
        }

        #[tokio::test]
        async fn debouncer_restarts_and_cancels() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut debouncer = Debouncer::new(Duration::from_millis(30));
            debouncer.schedule(&tx, 1);
            debouncer.schedule(&tx, 1);
            debouncer.schedule(&tx, 2);
            assert!(debouncer.is_pending());
            tokio::time::sleep(Duration::from_millis(100)).await;

            assert!(matches!(rx.try_recv(), Ok(SyncEvent::Reparse { epoch: 2 })));
            assert!(rx.try_recv().is_err());

            debouncer.schedule(&tx, 3);
            assert!(debouncer.cancel());
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(rx.try_recv().is_err());
        }
    }
}
