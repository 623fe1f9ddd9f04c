//! Cursor-based pagination over result sets.
//!
//! A cursor is self-contained: it carries the key of the last row a client
//! saw, the walking direction and the fingerprint of the result set it was
//! issued against. Nothing about it is kept on the server.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::PaginationConfig;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::results::{ResultRow, ResultSet, RowKey};
use arrears::api::v1::operation::{PageResponse, PaginationInfo, SortOrder};
use arrears::hash::Hash;

/// Version of the cursor encoding.
const CURSOR_VERSION: u8 = 1;

/// A decoded cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "v")]
    pub version: u8,

    /// The last row returned.
    #[serde(rename = "k")]
    pub last_key: RowKey,

    /// Column the result set is grouped by.
    #[serde(rename = "s")]
    pub sort_key: String,

    #[serde(rename = "d")]
    pub order: SortOrder,

    #[serde(rename = "f")]
    pub fingerprint: String,
}

/// Encodes a cursor that resumes after `last_key`.
pub fn encode_cursor(
    last_key: &RowKey,
    sort_key: &str,
    order: SortOrder,
    fingerprint: &str,
) -> ServerResult<String> {
    let cursor = Cursor {
        version: CURSOR_VERSION,
        last_key: last_key.clone(),
        sort_key: sort_key.to_string(),
        order,
        fingerprint: fingerprint.to_string(),
    };

    let json = serde_json::to_vec(&cursor).map_err(ServerError::internal_error)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decodes a cursor token.
pub fn decode_cursor(token: &str) -> ServerResult<Cursor> {
    let json = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| invalid_cursor("not a valid token"))?;

    let cursor: Cursor =
        serde_json::from_slice(&json).map_err(|_| invalid_cursor("malformed token"))?;

    if cursor.version != CURSOR_VERSION {
        return Err(invalid_cursor("unsupported version"));
    }

    Ok(cursor)
}

/// Splits a comma-separated field list.
pub fn parse_fields(fields: Option<&str>) -> Vec<String> {
    fields
        .map(|fields| {
            fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// A page of a result set.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Map<String, Value>>,
    pub next_cursor: Option<String>,
    pub has_more: bool,

    /// The page size after clamping.
    pub limit: usize,

    pub total_count: usize,
}

impl Page {
    pub fn into_response(self, summary: Value) -> PageResponse {
        PageResponse {
            items: self.items,
            pagination: PaginationInfo {
                next_cursor: self.next_cursor,
                has_more: self.has_more,
                limit: self.limit,
                total_count: self.total_count,
            },
            summary,
        }
    }
}

/// Cuts result sets into pages.
#[derive(Debug, Clone)]
pub struct Paginator {
    default_limit: usize,
    max_limit: usize,
}

impl Paginator {
    pub fn new(config: &PaginationConfig) -> Self {
        Self {
            default_limit: config.default_limit,
            max_limit: config.max_limit,
        }
    }

    /// Clamps a requested page size to `1..=max_limit`.
    pub fn clamp_limit(&self, limit: Option<i64>) -> usize {
        let max_limit = self.max_limit.max(1);

        match limit {
            None => self.default_limit.clamp(1, max_limit),
            Some(limit) => {
                let ceiling = i64::try_from(max_limit).unwrap_or(i64::MAX);
                usize::try_from(limit.clamp(1, ceiling)).unwrap_or(max_limit)
            }
        }
    }

    /// Returns the page that follows `cursor`, or the first page.
    ///
    /// With a cursor, the direction stored in the cursor wins over `order`.
    /// An empty `fields` list returns whole rows.
    pub fn page(
        &self,
        result: &ResultSet,
        cursor: Option<&str>,
        limit: Option<i64>,
        fields: &[String],
        order: SortOrder,
    ) -> ServerResult<Page> {
        let limit = self.clamp_limit(limit);

        let (after, order) = match cursor {
            Some(token) => {
                let cursor = decode_cursor(token)?;

                if cursor.fingerprint != result.fingerprint {
                    return Err(ErrorKind::StaleCursor.into());
                }

                if cursor.sort_key != result.sort_key {
                    return Err(invalid_cursor("issued for a different ordering"));
                }

                (Some(cursor.last_key), cursor.order)
            }
            None => (None, order),
        };

        let rows = result.rows();
        let (page, has_more): (Vec<&ResultRow>, bool) = match order {
            SortOrder::Asc => {
                let start = after
                    .as_ref()
                    .map(|last| rows.partition_point(|row| &row.key <= last))
                    .unwrap_or(0);
                let remaining = &rows[start..];

                (remaining.iter().take(limit).collect(), remaining.len() > limit)
            }
            SortOrder::Desc => {
                let end = after
                    .as_ref()
                    .map(|last| rows.partition_point(|row| &row.key < last))
                    .unwrap_or(rows.len());
                let remaining = &rows[..end];

                (
                    remaining.iter().rev().take(limit).collect(),
                    remaining.len() > limit,
                )
            }
        };

        let next_cursor = match page.last() {
            Some(last) if has_more => Some(encode_cursor(
                &last.key,
                &result.sort_key,
                order,
                &result.fingerprint,
            )?),
            _ => None,
        };

        let items = page.into_iter().map(|row| project(row, fields)).collect();

        Ok(Page {
            items,
            next_cursor,
            has_more,
            limit,
            total_count: result.len(),
        })
    }
}

/// Returns the entity tag of a page request.
///
/// Two requests share a tag exactly when they select the same rows of the
/// same result set in the same shape.
pub fn page_etag(
    result: &ResultSet,
    cursor: Option<&str>,
    limit: usize,
    fields: &[String],
    order: SortOrder,
) -> String {
    let order = match order {
        SortOrder::Asc => "asc",
        SortOrder::Desc => "desc",
    };
    let key = format!(
        "{}\n{}\n{}\n{}\n{}",
        result.fingerprint,
        cursor.unwrap_or_default(),
        limit,
        fields.join(","),
        order,
    );

    format!("\"{}\"", Hash::sha256_from_bytes(key.as_bytes()).to_typed_base16())
}

/// Whether an `If-None-Match` value matches `etag`.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(|tag| tag.trim().trim_start_matches("W/"))
        .any(|tag| tag == "*" || tag == etag)
}

/// Keeps only the requested fields of a row.
fn project(row: &ResultRow, fields: &[String]) -> Map<String, Value> {
    if fields.is_empty() {
        return row.fields.clone();
    }

    fields
        .iter()
        .filter_map(|name| {
            row.fields
                .get(name)
                .map(|value| (name.clone(), value.clone()))
        })
        .collect()
}

fn invalid_cursor(reason: &str) -> ServerError {
    ErrorKind::InvalidCursor(reason.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::results::tests::officer_rows;
    use arrears::report::ReportKind;

    fn paginator() -> Paginator {
        Paginator::new(&PaginationConfig::default())
    }

    fn ids(page: &Page) -> Vec<u64> {
        page.items
            .iter()
            .map(|item| item["row_id"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_cursor_encoding() {
        let key = RowKey {
            group: "Mensah".to_string(),
            id: 42,
        };
        let token = encode_cursor(&key, "FieldOfficer", SortOrder::Desc, "abc").unwrap();
        assert!(!token.contains('='));

        let cursor = decode_cursor(&token).unwrap();
        assert_eq!(cursor.last_key, key);
        assert_eq!(cursor.order, SortOrder::Desc);
        assert_eq!(cursor.fingerprint, "abc");
    }

    #[test]
    fn test_invalid_cursors() {
        let version_2 = URL_SAFE_NO_PAD.encode(
            r#"{"v":2,"k":{"group":"a","id":1},"s":"FieldOfficer","d":"asc","f":"x"}"#,
        );

        for token in ["", "!!!", "bm90IGpzb24", version_2.as_str()] {
            let err = decode_cursor(token).unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::InvalidCursor(_)),
                "{:?} should be rejected",
                token
            );
        }
    }

    #[test]
    fn test_walks_every_row_once() {
        let result = officer_rows(5);
        let paginator = paginator();

        let mut cursor = None;
        let mut seen = Vec::new();
        let mut sizes = Vec::new();
        let mut more = Vec::new();

        loop {
            let page = paginator
                .page(&result, cursor.as_deref(), Some(2), &[], SortOrder::Asc)
                .unwrap();
            sizes.push(page.items.len());
            more.push(page.has_more);
            seen.extend(ids(&page));
            assert_eq!(page.total_count, 5);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(more, vec![true, true, false]);

        let expected: Vec<u64> = result.rows().iter().map(|row| row.key.id).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_descending() {
        let result = officer_rows(5);
        let paginator = paginator();

        let first = paginator
            .page(&result, None, Some(3), &[], SortOrder::Desc)
            .unwrap();
        let second = paginator
            .page(
                &result,
                first.next_cursor.as_deref(),
                Some(3),
                &[],
                SortOrder::Asc,
            )
            .unwrap();

        let mut expected: Vec<u64> = result.rows().iter().map(|row| row.key.id).collect();
        expected.reverse();

        let mut walked = ids(&first);
        walked.extend(ids(&second));
        assert_eq!(walked, expected);
        assert!(!second.has_more);
    }

    #[test]
    fn test_exact_fit_has_no_more() {
        let result = officer_rows(4);
        let page = paginator()
            .page(&result, None, Some(4), &[], SortOrder::Asc)
            .unwrap();

        assert_eq!(page.items.len(), 4);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_limit_is_clamped() {
        let paginator = paginator();
        assert_eq!(paginator.clamp_limit(None), 20);
        assert_eq!(paginator.clamp_limit(Some(0)), 1);
        assert_eq!(paginator.clamp_limit(Some(1000)), 100);
        assert_eq!(paginator.clamp_limit(Some(-1)), 1);
        assert_eq!(paginator.clamp_limit(Some(i64::MIN)), 1);
        assert_eq!(paginator.clamp_limit(Some(i64::MAX)), 100);

        let result = officer_rows(3);
        let page = paginator
            .page(&result, None, Some(0), &[], SortOrder::Asc)
            .unwrap();
        assert_eq!(page.limit, 1);
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn test_projection() {
        let result = officer_rows(3);
        let fields = parse_fields(Some("FieldOfficer, nope,,"));
        assert_eq!(fields, vec!["FieldOfficer".to_string(), "nope".to_string()]);

        let page = paginator()
            .page(&result, None, None, &fields, SortOrder::Asc)
            .unwrap();
        for item in &page.items {
            assert_eq!(item.len(), 1);
            assert!(item.contains_key("FieldOfficer"));
        }

        // Projection does not touch the stored rows.
        assert_eq!(result.summary()["totals"]["Arrears"], 60.0);
    }

    #[test]
    fn test_stale_cursor_after_recomputation() {
        let before = officer_rows(5);
        let paginator = paginator();

        let page = paginator
            .page(&before, None, Some(2), &[], SortOrder::Asc)
            .unwrap();
        let cursor = page.next_cursor.unwrap();

        let after = officer_rows(5);
        let err = paginator
            .page(&after, Some(cursor.as_str()), Some(2), &[], SortOrder::Asc)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::StaleCursor));

        // The same cursor still resumes against the run it came from.
        let resumed = paginator
            .page(&before, Some(cursor.as_str()), Some(2), &[], SortOrder::Asc)
            .unwrap();
        assert_eq!(resumed.items.len(), 2);
    }

    #[test]
    fn test_recomputed_with_new_ordering_is_stale() {
        let before = officer_rows(5);
        let paginator = paginator();
        let cursor = paginator
            .page(&before, None, Some(2), &[], SortOrder::Asc)
            .unwrap()
            .next_cursor
            .unwrap();

        let rows = before
            .rows()
            .iter()
            .map(|row| ResultRow {
                key: RowKey {
                    group: String::new(),
                    id: row.key.id,
                },
                fields: row.fields.clone(),
            })
            .collect();
        let after = ResultSet::new(
            "op".to_string(),
            ReportKind::ArrangeDues,
            "row_id".to_string(),
            before.columns.clone(),
            rows,
        );

        let err = paginator
            .page(&after, Some(cursor.as_str()), Some(2), &[], SortOrder::Asc)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::StaleCursor));
    }

    #[test]
    fn test_cursor_for_other_ordering_is_invalid() {
        let result = officer_rows(5);
        let token = encode_cursor(
            &result.rows()[0].key,
            "Arrears",
            SortOrder::Asc,
            &result.fingerprint,
        )
        .unwrap();

        let err = paginator()
            .page(&result, Some(token.as_str()), None, &[], SortOrder::Asc)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidCursor(_)));
    }

    #[test]
    fn test_page_etag() {
        let result = officer_rows(5);
        let fields = vec!["FieldOfficer".to_string()];

        let etag = page_etag(&result, None, 20, &fields, SortOrder::Asc);
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag, page_etag(&result, None, 20, &fields, SortOrder::Asc));
        assert_ne!(etag, page_etag(&result, None, 21, &fields, SortOrder::Asc));
        assert_ne!(etag, page_etag(&result, Some("c"), 20, &fields, SortOrder::Asc));
        assert_ne!(etag, page_etag(&result, None, 20, &[], SortOrder::Asc));
        assert_ne!(etag, page_etag(&result, None, 20, &fields, SortOrder::Desc));

        let recomputed = officer_rows(5);
        assert_ne!(etag, page_etag(&recomputed, None, 20, &fields, SortOrder::Asc));

        assert!(etag_matches(&etag, &etag));
        assert!(etag_matches(&format!("\"other\", W/{}", etag), &etag));
        assert!(etag_matches("*", &etag));
        assert!(!etag_matches("\"other\"", &etag));
    }
}
