//! Persisted album hierarchy: lookups, writes and tree traversals.

use crate::db::{self, media_from_row, MEDIA_COLUMNS};
use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::models::{Album, Media};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

const ALBUM_COLUMNS: &str = "id, title, parent_album_id, path, path_hash, cover_id, \
     last_modify_time, last_last_modify_time";

fn album_from_row(row: &Row<'_>) -> rusqlite::Result<Album> {
    Ok(Album {
        id: row.get(0)?,
        title: row.get(1)?,
        parent_album_id: row.get(2)?,
        path: row.get(3)?,
        path_hash: row.get(4)?,
        cover_id: row.get(5)?,
        last_modify_time: row.get(6)?,
        last_last_modify_time: row.get(7)?,
    })
}

pub fn find_album(conn: &Connection, album_id: i64) -> Result<Option<Album>> {
    let album = conn
        .query_row(
            &format!("SELECT {ALBUM_COLUMNS} FROM albums WHERE id = ?1"),
            [album_id],
            album_from_row,
        )
        .optional()?;
    Ok(album)
}

pub fn find_album_by_fingerprint(conn: &Connection, path_hash: &str) -> Result<Option<Album>> {
    let album = conn
        .query_row(
            &format!("SELECT {ALBUM_COLUMNS} FROM albums WHERE path_hash = ?1"),
            [path_hash],
            album_from_row,
        )
        .optional()?;
    Ok(album)
}

pub fn find_album_by_path(conn: &Connection, path: &Path) -> Result<Option<Album>> {
    find_album_by_fingerprint(conn, &fingerprint(path)?)
}

/// Every album the user owns.
pub fn user_albums(conn: &Connection, user_id: i64) -> Result<Vec<Album>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM albums JOIN user_albums ON user_albums.album_id = albums.id
         WHERE user_albums.user_id = ?1 ORDER BY albums.id",
        prefixed_columns("albums")
    ))?;
    let albums = stmt
        .query_map([user_id], album_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(albums)
}

pub struct NewAlbum<'a> {
    pub title: &'a str,
    pub parent_album_id: Option<i64>,
    pub path: &'a Path,
    pub modify_time: Option<i64>,
}

pub fn insert_album(conn: &Connection, album: NewAlbum<'_>) -> Result<Album> {
    let path = album.path.to_string_lossy().to_string();
    let path_hash = fingerprint(album.path)?;
    conn.execute(
        "INSERT INTO albums (title, parent_album_id, path, path_hash, last_modify_time)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            album.title,
            album.parent_album_id,
            path,
            path_hash,
            album.modify_time
        ],
    )?;
    Ok(Album {
        id: conn.last_insert_rowid(),
        title: album.title.to_string(),
        parent_album_id: album.parent_album_id,
        path,
        path_hash,
        cover_id: None,
        last_modify_time: album.modify_time,
        last_last_modify_time: None,
    })
}

/// Stores a new watermark, keeping the previous one as audit trail.
pub fn set_album_watermark(conn: &Connection, album_id: i64, modify_time: i64) -> Result<()> {
    conn.execute(
        "UPDATE albums SET last_last_modify_time = last_modify_time, last_modify_time = ?1
         WHERE id = ?2",
        params![modify_time, album_id],
    )?;
    Ok(())
}

pub fn set_album_cover(conn: &Connection, album_id: i64, cover_id: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE albums SET cover_id = ?1 WHERE id = ?2",
        params![cover_id, album_id],
    )?;
    Ok(())
}

/// Registers `path` as one of the user's root albums. Existing albums only gain the owner.
pub fn add_root_album(conn: &Connection, user_id: i64, path: impl AsRef<Path>) -> Result<Album> {
    let path = path.as_ref();
    let album = match find_album_by_path(conn, path)? {
        Some(album) => album,
        None => {
            let title = base_name(path);
            insert_album(
                conn,
                NewAlbum {
                    title: &title,
                    parent_album_id: None,
                    path,
                    modify_time: None,
                },
            )?
        }
    };
    db::add_album_owner(conn, album.id, user_id)?;
    Ok(album)
}

/// The given albums and all their transitive children.
pub fn descendants(conn: &Connection, album_ids: &[i64]) -> Result<Vec<Album>> {
    if album_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; album_ids.len()].join(", ");
    let sql = format!(
        "WITH RECURSIVE sub_albums AS (
            SELECT * FROM albums AS root WHERE id IN ({placeholders})
            UNION
            SELECT child.* FROM albums AS child JOIN sub_albums ON child.parent_album_id = sub_albums.id
        )
        SELECT {ALBUM_COLUMNS} FROM sub_albums ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let albums = stmt
        .query_map(params_from_iter(album_ids.iter()), album_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(albums)
}

/// The album followed by its parent chain up to the root, leaf first.
pub fn ancestors(conn: &Connection, album_id: i64) -> Result<Vec<Album>> {
    let sql = format!(
        "WITH RECURSIVE super_albums(depth, {ALBUM_COLUMNS}) AS (
            SELECT 0, {leaf} FROM albums AS leaf WHERE id = ?1
            UNION
            SELECT super_albums.depth + 1, {parent} FROM albums AS parent
            JOIN super_albums ON parent.id = super_albums.parent_album_id
        )
        SELECT {ALBUM_COLUMNS} FROM super_albums ORDER BY depth",
        leaf = prefixed_columns("leaf"),
        parent = prefixed_columns("parent"),
    );
    let mut stmt = conn.prepare(&sql)?;
    let albums = stmt
        .query_map([album_id], album_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(albums)
}

/// Cover image for an album: the explicit cover, else the newest media of the album or a
/// direct child album.
pub fn thumbnail(conn: &Connection, album: &Album) -> Result<Option<Media>> {
    if let Some(cover_id) = album.cover_id {
        if let Some(media) = db::find_media(conn, cover_id)? {
            return Ok(Some(media));
        }
    }
    let media = conn
        .query_row(
            &format!(
                "SELECT {MEDIA_COLUMNS} FROM media
                 WHERE album_id IN (SELECT id FROM albums WHERE id = ?1 OR parent_album_id = ?1)
                 ORDER BY id DESC LIMIT 1"
            ),
            [album.id],
            media_from_row,
        )
        .optional()?;
    Ok(media)
}

/// Forces the next scan to revisit every catalogued album on the way from `path` up to the
/// filesystem root. Returns how many albums were touched.
pub fn mark_modified(conn: &Connection, path: &Path, now: i64) -> Result<usize> {
    let mut touched = 0;
    for dir in path.ancestors() {
        if dir.as_os_str().is_empty() {
            break;
        }
        if let Some(album) = find_album_by_path(conn, dir)? {
            set_album_watermark(conn, album.id, now)?;
            touched += 1;
        }
    }
    Ok(touched)
}

pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn prefixed_columns(table: &str) -> String {
    ALBUM_COLUMNS
        .split(", ")
        .map(|column| format!("{table}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// In-memory parent-indexed view over a set of albums.
#[derive(Debug, Default)]
pub struct AlbumForest {
    albums: HashMap<i64, Album>,
    children: HashMap<i64, Vec<i64>>,
}

impl AlbumForest {
    pub fn new(albums: impl IntoIterator<Item = Album>) -> Self {
        let mut forest = Self::default();
        for album in albums {
            if let Some(parent) = album.parent_album_id {
                forest.children.entry(parent).or_default().push(album.id);
            }
            forest.albums.insert(album.id, album);
        }
        for ids in forest.children.values_mut() {
            ids.sort_unstable();
        }
        forest
    }

    pub fn get(&self, album_id: i64) -> Option<&Album> {
        self.albums.get(&album_id)
    }

    /// Albums whose parent is not part of the forest.
    pub fn roots(&self) -> Vec<&Album> {
        let mut roots: Vec<&Album> = self
            .albums
            .values()
            .filter(|album| match album.parent_album_id {
                Some(parent) => !self.albums.contains_key(&parent),
                None => true,
            })
            .collect();
        roots.sort_by_key(|album| album.id);
        roots
    }

    /// Breadth-first: the album itself, then its transitive children.
    pub fn descendants(&self, album_id: i64) -> Vec<&Album> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([album_id]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(album) = self.albums.get(&id) {
                out.push(album);
            }
            if let Some(children) = self.children.get(&id) {
                queue.extend(children.iter().copied());
            }
        }
        out
    }

    /// The album and its parent chain, leaf first.
    pub fn ancestors(&self, album_id: i64) -> Vec<&Album> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.albums.get(&album_id);
        while let Some(album) = current {
            if !seen.insert(album.id) {
                break;
            }
            out.push(album);
            current = album.parent_album_id.and_then(|id| self.albums.get(&id));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_user, insert_media, NewMedia};
    use crate::models::MediaType;
    use crate::test_support::TestLibrary;
    use chrono::Utc;

    fn child(conn: &Connection, parent: &Album, name: &str) -> Album {
        let path = Path::new(&parent.path).join(name);
        insert_album(
            conn,
            NewAlbum {
                title: name,
                parent_album_id: Some(parent.id),
                path: &path,
                modify_time: Some(1),
            },
        )
        .unwrap()
    }

    fn ids<'a>(albums: impl IntoIterator<Item = &'a Album>) -> Vec<i64> {
        let mut ids: Vec<i64> = albums.into_iter().map(|a| a.id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn recursive_queries_match_in_memory_forest() {
        let lib = TestLibrary::new();
        let conn = lib.pool.get().unwrap();
        let user = create_user(&conn, "alice", false).unwrap();
        let root = add_root_album(&conn, user.id, "/p/Family").unwrap();
        let y2020 = child(&conn, &root, "2020");
        let summer = child(&conn, &y2020, "summer");
        let y2021 = child(&conn, &root, "2021");

        let stored = descendants(&conn, &[root.id]).unwrap();
        assert_eq!(ids(&stored), vec![root.id, y2020.id, summer.id, y2021.id]);

        let forest = AlbumForest::new(stored.clone());
        assert_eq!(ids(forest.descendants(y2020.id)), ids(&descendants(&conn, &[y2020.id]).unwrap()));

        let chain = ancestors(&conn, summer.id).unwrap();
        assert_eq!(
            chain.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![summer.id, y2020.id, root.id]
        );
        assert_eq!(
            forest.ancestors(summer.id).iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![summer.id, y2020.id, root.id]
        );
        assert_eq!(ids(forest.roots()), vec![root.id]);
    }

    #[test]
    fn roots_are_albums_with_foreign_parents() {
        let a = Album { id: 1, parent_album_id: None, ..Default::default() };
        let b = Album { id: 2, parent_album_id: Some(1), ..Default::default() };
        let c = Album { id: 3, parent_album_id: Some(99), ..Default::default() };
        let forest = AlbumForest::new(vec![a, b, c]);
        assert_eq!(ids(forest.roots()), vec![1, 3]);
    }

    #[test]
    fn watermark_update_keeps_previous_value() {
        let lib = TestLibrary::new();
        let conn = lib.pool.get().unwrap();
        let user = create_user(&conn, "alice", false).unwrap();
        let root = add_root_album(&conn, user.id, "/p/Family").unwrap();
        set_album_watermark(&conn, root.id, 10).unwrap();
        set_album_watermark(&conn, root.id, 20).unwrap();
        let stored = find_album(&conn, root.id).unwrap().unwrap();
        assert_eq!(stored.last_modify_time, Some(20));
        assert_eq!(stored.last_last_modify_time, Some(10));
    }

    #[test]
    fn add_root_album_is_idempotent_per_path() {
        let lib = TestLibrary::new();
        let conn = lib.pool.get().unwrap();
        let alice = create_user(&conn, "alice", false).unwrap();
        let bob = create_user(&conn, "bob", false).unwrap();
        let first = add_root_album(&conn, alice.id, "/p/Family").unwrap();
        let second = add_root_album(&conn, bob.id, "/p/Family").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.title, "Family");
        assert_eq!(db::album_owners(&conn, first.id).unwrap(), vec![alice.id, bob.id]);
    }

    #[test]
    fn thumbnail_prefers_cover_then_newest_nearby_media() {
        let lib = TestLibrary::new();
        let conn = lib.pool.get().unwrap();
        let user = create_user(&conn, "alice", false).unwrap();
        let root = add_root_album(&conn, user.id, "/p/Family").unwrap();
        let sub = child(&conn, &root, "2020");
        assert!(thumbnail(&conn, &root).unwrap().is_none());

        let insert = |album_id: i64, name: &str| {
            insert_media(
                &conn,
                NewMedia {
                    title: name,
                    path: name,
                    path_hash: name,
                    album_id,
                    media_type: MediaType::Photo,
                    date_shot: Utc::now(),
                },
            )
            .unwrap()
        };
        let older = insert(root.id, "a.jpg");
        let newer = insert(sub.id, "b.jpg");
        assert_eq!(thumbnail(&conn, &root).unwrap().unwrap().id, newer.id);

        set_album_cover(&conn, root.id, Some(older.id)).unwrap();
        let root = find_album(&conn, root.id).unwrap().unwrap();
        assert_eq!(thumbnail(&conn, &root).unwrap().unwrap().id, older.id);
    }

    #[test]
    fn mark_modified_touches_every_catalogued_ancestor() {
        let lib = TestLibrary::new();
        let conn = lib.pool.get().unwrap();
        let user = create_user(&conn, "alice", false).unwrap();
        let root = add_root_album(&conn, user.id, "/p/Family").unwrap();
        let sub = child(&conn, &root, "2020");

        let touched = mark_modified(&conn, Path::new("/p/Family/2020/new.jpg"), 99).unwrap();
        assert_eq!(touched, 2);
        assert_eq!(find_album(&conn, sub.id).unwrap().unwrap().last_modify_time, Some(99));
        assert_eq!(find_album(&conn, root.id).unwrap().unwrap().last_modify_time, Some(99));
    }
}
