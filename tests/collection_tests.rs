use persistry::prelude::advanced::build_where;
use persistry::{
    Collection, Dialect, ErrorCode, FieldDef, Filter, InstrumentedAdapter, ListOptions, OrderBy,
    PersistSession, Record, Registry, RelationSlot, SqliteAdapter, TypeDescriptor, Value, record,
};
use std::sync::Arc;

struct Library {
    adapter: Arc<InstrumentedAdapter<SqliteAdapter>>,
    authors: Collection,
    books: Collection,
}

async fn library() -> Library {
    let registry = Registry::new();
    registry
        .register(
            TypeDescriptor::new("Author")
                .field("country", FieldDef::text())
                .field("books", FieldDef::one_to_many("Book")),
        )
        .unwrap();
    registry
        .register(
            TypeDescriptor::new("Book")
                .field("pages", FieldDef::integer().min(1.0))
                .field("author", FieldDef::foreign_key("Author")),
        )
        .unwrap();

    let adapter = Arc::new(InstrumentedAdapter::new(SqliteAdapter::open_in_memory().unwrap()));
    let session = PersistSession::new(adapter.clone());
    let authors = registry.get_or_create_collection("Author", &session).await.unwrap();
    let books = registry.get_or_create_collection("Book", &session).await.unwrap();
    Library {
        adapter,
        authors,
        books,
    }
}

async fn seed_books(lib: &Library, per_author: usize) -> Vec<String> {
    let mut author_ids = Vec::new();
    for name in ["Le Guin", "Borges"] {
        let author = lib.authors.insert(record! { "name" => name }).await.unwrap();
        let id = author.id().unwrap();
        for n in 0..per_author {
            lib.books
                .insert(record! {
                    "name" => format!("{} volume {}", name, n),
                    "pages" => 100 + n as i64,
                    "author" => id.as_str(),
                })
                .await
                .unwrap();
        }
        author_ids.push(id);
    }
    author_ids
}

#[tokio::test]
async fn foreign_key_include_costs_one_query_regardless_of_size() {
    for per_author in [1, 5] {
        let lib = library().await;
        let author_ids = seed_books(&lib, per_author).await;
        lib.books
            .insert(record! { "name" => "Anonymous pamphlet", "pages" => 4 })
            .await
            .unwrap();

        lib.adapter.reset();
        let plain = lib.books.list(ListOptions::new()).await.unwrap();
        assert_eq!(lib.adapter.stats().queries, 1);
        assert!(plain.iter().all(|book| book.related("author").is_none()));

        lib.adapter.reset();
        let books = lib
            .books
            .list(ListOptions::new().include("author").include("author"))
            .await
            .unwrap();
        assert_eq!(lib.adapter.stats().queries, 2);
        assert_eq!(books.len(), per_author * 2 + 1);

        for book in &books {
            match book.get("author").and_then(|v| v.key_string()) {
                Some(author_id) => {
                    let author = book.related_one("author").expect("author loaded");
                    assert_eq!(author.id(), Some(author_id.clone()));
                    assert!(author_ids.contains(&author_id));
                }
                None => {
                    assert!(matches!(book.related("author"), Some(RelationSlot::Loaded(None))));
                }
            }
        }
    }
}

#[tokio::test]
async fn one_to_many_include_groups_children_by_parent() {
    let lib = library().await;
    seed_books(&lib, 3).await;
    lib.authors.insert(record! { "name" => "Unpublished" }).await.unwrap();

    lib.adapter.reset();
    let authors = lib
        .authors
        .list(ListOptions::new().include("books").order_by(OrderBy::asc("name")))
        .await
        .unwrap();
    assert_eq!(lib.adapter.stats().queries, 2);

    let counts: Vec<(String, usize)> = authors
        .iter()
        .map(|author| {
            (
                author.name().unwrap_or_default().to_string(),
                author.related_many("books").map(|books| books.len()).unwrap_or(99),
            )
        })
        .collect();
    assert_eq!(
        counts,
        vec![
            ("Borges".to_string(), 3),
            ("Le Guin".to_string(), 3),
            ("Unpublished".to_string(), 0),
        ]
    );
}

#[tokio::test]
async fn filters_cover_every_operator() {
    let lib = library().await;
    seed_books(&lib, 4).await;

    let count = |filter: Filter| {
        let books = lib.books.clone();
        async move { books.count(ListOptions::new().filter(filter)).await.unwrap() }
    };

    assert_eq!(count(Filter::new().gte("pages", 102)).await, 4);
    assert_eq!(count(Filter::new().lt("pages", 101)).await, 2);
    assert_eq!(count(Filter::new().is_in("pages", vec![100, 103])).await, 4);
    assert_eq!(count(Filter::new().not_in("pages", vec![100])).await, 6);
    assert_eq!(count(Filter::new().is_in("pages", Vec::<i64>::new())).await, 0);
    assert_eq!(count(Filter::new().like("name", "Borges%")).await, 4);
    assert_eq!(count(Filter::new().is_null("author")).await, 0);
    assert_eq!(count(Filter::new().eq("pages", 101).ne("name", "Borges volume 1")).await, 1);

    let err = lib
        .books
        .list(ListOptions::new().filter(Filter::new().eq("pages; DROP TABLE book", 1)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidIdentifier);

    let parsed = Filter::from_pairs(vec![
        ("pages >", Value::from(101)),
        ("name like", Value::from("%volume 3")),
    ])
    .unwrap();
    assert_eq!(count(parsed).await, 2);
}

#[test]
fn where_clause_placeholders_match_parameters() {
    let filters = vec![
        Filter::new(),
        Filter::new().eq("a", 1).is_null("b"),
        Filter::new().is_in("a", vec!["x", "y", "z"]).gt("b", 2.5),
        Filter::new().not_in("a", Vec::<i64>::new()).like("c", "%q%").ne("d", Value::Null),
    ];

    for dialect in [Dialect::Sqlite, Dialect::Postgres, Dialect::DuckDb] {
        for filter in &filters {
            let clause = build_where(filter, dialect, 3).unwrap();
            let placeholders = (3..3 + clause.params.len())
                .filter(|n| clause.sql.contains(&dialect.placeholder(*n)))
                .count();
            assert_eq!(placeholders, clause.params.len(), "{}", clause.sql);
            assert_eq!(filter.is_empty(), clause.sql.is_empty());
        }
    }
}

#[tokio::test]
async fn pagination_and_lookup_forms() {
    let lib = library().await;
    seed_books(&lib, 3).await;

    let page = lib
        .books
        .list(
            ListOptions::new()
                .order_by(OrderBy::desc("pages"))
                .order_by(OrderBy::asc("name"))
                .offset(2)
                .limit(2),
        )
        .await
        .unwrap();
    let names: Vec<&str> = page.iter().filter_map(|b| b.name()).collect();
    assert_eq!(names, vec!["Borges volume 1", "Le Guin volume 1"]);

    let by_slug = lib.books.get("borges-volume-2").await.unwrap().unwrap();
    let by_id = lib.books.get(by_slug.id().unwrap()).await.unwrap().unwrap();
    assert_eq!(by_id.slug(), Some("borges-volume-2"));
    let by_filter = lib
        .books
        .get(Filter::new().eq("pages", 102).eq("slug", "le-guin-volume-2"))
        .await
        .unwrap();
    assert!(by_filter.is_some());
    assert!(lib.books.get("no-such-book").await.unwrap().is_none());
}

#[tokio::test]
async fn get_or_upsert_matches_on_slug_and_context() {
    let lib = library().await;

    let draft = lib
        .books
        .get_or_upsert(
            record! { "slug" => "atlas", "context" => "drafts" },
            record! { "name" => "Atlas", "pages" => 10 },
        )
        .await
        .unwrap();
    let published = lib
        .books
        .get_or_upsert(record! { "slug" => "atlas" }, record! { "pages" => 300 })
        .await
        .unwrap();
    assert_ne!(draft.id(), published.id());

    let again = lib
        .books
        .get_or_upsert(
            record! { "slug" => "atlas", "context" => "drafts", "pages" => 12 },
            Record::new(),
        )
        .await
        .unwrap();
    assert_eq!(again.id(), draft.id());
    assert_eq!(again.get("pages"), Some(Value::Integer(12)));
    assert_eq!(again.created_at(), draft.created_at());
    assert_eq!(lib.books.count(ListOptions::new()).await.unwrap(), 2);

    let fresh = lib.books.get_or_upsert(Record::new(), record! { "pages" => 7 }).await.unwrap();
    assert!(fresh.id().is_some());
    assert_eq!(lib.books.count(ListOptions::new()).await.unwrap(), 3);
}

#[tokio::test]
async fn keyword_type_and_field_names_work_end_to_end() {
    let registry = Registry::new();
    registry
        .register(
            TypeDescriptor::new("Order")
                .field("group", FieldDef::text().indexed())
                .field("limit", FieldDef::integer().min(0.0))
                .field("lines", FieldDef::one_to_many("Line")),
        )
        .unwrap();
    registry
        .register(
            TypeDescriptor::new("Line")
                .field("order", FieldDef::foreign_key("Order"))
                .field("desc", FieldDef::text()),
        )
        .unwrap();
    let session = PersistSession::in_memory().unwrap();
    let orders = registry.get_or_create_collection("Order", &session).await.unwrap();
    let lines = registry.get_or_create_collection("Line", &session).await.unwrap();

    let mut first = orders
        .insert(record! { "name" => "First", "group" => "b", "limit" => 3 })
        .await
        .unwrap();
    orders
        .insert(record! { "name" => "Second", "group" => "a", "limit" => 7 })
        .await
        .unwrap();
    lines
        .insert(record! { "name" => "Widget", "order" => first.id().unwrap(), "desc" => "blue" })
        .await
        .unwrap();

    let sorted = orders
        .list(ListOptions::new().order_by(OrderBy::asc("group")))
        .await
        .unwrap();
    let names: Vec<&str> = sorted.iter().filter_map(|o| o.name()).collect();
    assert_eq!(names, vec!["Second", "First"]);
    assert_eq!(
        orders
            .count(ListOptions::new().filter(Filter::new().gt("limit", 5)))
            .await
            .unwrap(),
        1
    );

    first.set("limit", 4).unwrap();
    first.save().await.unwrap();
    let stored = orders.get("first").await.unwrap().unwrap();
    assert_eq!(stored.get("limit"), Some(Value::Integer(4)));

    let with_lines = orders
        .list(ListOptions::new().filter(Filter::new().eq("group", "b")).include("lines"))
        .await
        .unwrap();
    assert_eq!(with_lines[0].related_many("lines").map(|l| l.len()), Some(1));
    let line = lines
        .list(ListOptions::new().include("order"))
        .await
        .unwrap()
        .remove(0);
    assert_eq!(line.related_one("order").and_then(|o| o.name()), Some("First"));

    assert!(first.delete().await.unwrap());
    assert_eq!(orders.count(ListOptions::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn many_to_many_include_is_skipped_without_a_query() {
    let registry = Registry::new();
    registry
        .register(TypeDescriptor::new("Tag").field("label", FieldDef::text()))
        .unwrap();
    registry
        .register(
            TypeDescriptor::new("Post")
                .field("body", FieldDef::text())
                .field("tags", FieldDef::many_to_many("Tag")),
        )
        .unwrap();
    let adapter = Arc::new(InstrumentedAdapter::new(SqliteAdapter::open_in_memory().unwrap()));
    let session = PersistSession::new(adapter.clone());
    let posts = registry.get_or_create_collection("Post", &session).await.unwrap();
    posts.insert(record! { "name" => "Hello" }).await.unwrap();
    posts.insert(record! { "name" => "World" }).await.unwrap();

    adapter.reset();
    let listed = posts.list(ListOptions::new().include("tags")).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(adapter.stats().queries, 1);
    for post in &listed {
        assert!(matches!(post.relation("tags"), Some(RelationSlot::Unloaded)));
        assert!(post.related("tags").is_none());
    }
}
