//! Diesel schema (hand-written, replaceable with `diesel print-schema`).
//!
//! A single `documents` table, shared by the five collections
//! (`archives`/`messages`/`threads`/`chunks`/`summaries`), discriminated by
//! the `collection` column. Each entity's immutable fields live in
//! `payload` (JSONB); the mutable lifecycle fields have their own columns
//! so that `query` filters (equality, `$in`, `$lt`/`$gt` over
//! `last_updated`) don't need to index into the JSON.
//!
//! The required indexes are declared in the embedded migration
//! (`migrations/`), as partial/expression indexes over `payload` plus
//! composite indexes over `(collection, status, last_updated)`.

diesel::table! {
    documents (collection, key) {
        collection -> Text,
        key -> Text,
        payload -> Jsonb,
        status -> Text,
        attempt_count -> Integer,
        last_attempt_time -> Nullable<Timestamptz>,
        last_updated -> Timestamptz,
    }
}
