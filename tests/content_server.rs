mod common;

use std::sync::Arc;
use std::time::Duration;

use http::header;
use rstest::*;
use tokio_util::sync::CancellationToken;
use zipages::{
    ArchiveCache, Content, ContentServer, Error, LookupPath, ServeConfig, Served, Source,
};

use common::{ObjectServer, ZipBuilder};

const PREFIX: &str = "group/project/public/";
const ARCHIVE_KEY: &str = "group/project/public/artifacts.zip";

fn content_server(server: &ObjectServer) -> ContentServer {
    ContentServer::new(
        Arc::new(server.store()),
        Arc::new(ArchiveCache::new()),
        ServeConfig::default(),
    )
}

fn lookup() -> LookupPath {
    LookupPath::new(1, PREFIX)
}

fn archive() -> Vec<u8> {
    ZipBuilder::new()
        .stored("index.html", b"<h1>from archive</h1>")
        .deflated("docs/index.html", b"<p>archived docs</p>")
        .deflated("style.css", b"body { margin: 0 }")
        .build()
}

async fn serve(server: &ContentServer, lookup: &LookupPath, path: &str) -> Option<(Content, Vec<u8>)> {
    match server
        .serve(lookup, path, &CancellationToken::new())
        .await
        .unwrap()
    {
        Served::Content(mut content) => {
            let body = content.body.read_to_vec().await.unwrap();
            Some((content, body))
        }
        Served::NotServed => None,
    }
}

#[rstest]
#[case::root("/", "<h1>from archive</h1>")]
#[case::empty("", "<h1>from archive</h1>")]
#[case::file("index.html", "<h1>from archive</h1>")]
#[case::directory("docs/", "<p>archived docs</p>")]
#[case::dot_segments("docs/../style.css", "body { margin: 0 }")]
#[tokio::test]
async fn serves_from_archive(#[case] path: &str, #[case] expected: &str) {
    let objects = ObjectServer::new().await;
    objects.put(ARCHIVE_KEY, archive());
    let server = content_server(&objects);

    let (content, body) = serve(&server, &lookup(), path).await.unwrap();
    assert_eq!(content.source, Source::Archive);
    assert_eq!(body, expected.as_bytes());
    assert_eq!(
        content.headers[header::CONTENT_LENGTH],
        expected.len().to_string()
    );
}

#[tokio::test]
async fn archive_headers() {
    let objects = ObjectServer::new().await;
    objects.put(ARCHIVE_KEY, archive());
    let server = content_server(&objects);

    let (content, _) = serve(&server, &lookup(), "style.css").await.unwrap();
    let headers = &content.headers;
    assert_eq!(headers[header::CONTENT_TYPE], "text/css");
    assert_eq!(headers[header::LAST_MODIFIED], "Thu, 02 Jan 2020 03:04:06 GMT");
    assert_eq!(headers[header::CACHE_CONTROL], "max-age=600");

    let expires = httpdate::parse_http_date(headers[header::EXPIRES].to_str().unwrap()).unwrap();
    let ahead = expires
        .duration_since(std::time::SystemTime::now())
        .unwrap_or_default();
    assert!(ahead > Duration::from_secs(590) && ahead <= Duration::from_secs(600));
}

#[tokio::test]
async fn access_controlled_content_is_not_cacheable() {
    let objects = ObjectServer::new().await;
    objects.put(ARCHIVE_KEY, archive());
    objects.put(format!("{PREFIX}plain.txt").as_str(), "plain");
    let server = content_server(&objects);
    let lookup = lookup().with_access_control(true);

    for path in ["index.html", "plain.txt"] {
        let (content, _) = serve(&server, &lookup, path).await.unwrap();
        assert!(!content.headers.contains_key(header::CACHE_CONTROL));
        assert!(!content.headers.contains_key(header::EXPIRES));
        assert!(content.headers.contains_key(header::LAST_MODIFIED));
    }
}

#[tokio::test]
async fn missing_entry_falls_back_to_object() {
    let objects = ObjectServer::new().await;
    objects.put(ARCHIVE_KEY, archive());
    objects.put("group/project/public/robots.txt", "User-agent: *");
    let server = content_server(&objects);

    let (content, body) = serve(&server, &lookup(), "/robots.txt").await.unwrap();
    assert_eq!(content.source, Source::Object);
    assert_eq!(body, b"User-agent: *");
    assert_eq!(content.headers[header::CONTENT_TYPE], "text/plain");
    assert_eq!(
        content.headers[header::LAST_MODIFIED],
        httpdate::fmt_http_date(common::object_mtime())
    );
}

#[tokio::test]
async fn project_without_archive_serves_objects() {
    let objects = ObjectServer::new().await;
    objects.put("group/project/public/index.html", "<h1>loose file</h1>");
    let server = content_server(&objects);

    let (content, body) = serve(&server, &lookup(), "/").await.unwrap();
    assert_eq!(content.source, Source::Object);
    assert_eq!(body, b"<h1>loose file</h1>");
    assert_eq!(content.headers[header::CONTENT_TYPE], "text/html");
}

#[tokio::test]
async fn nothing_found_is_not_served() {
    let objects = ObjectServer::new().await;
    let server = content_server(&objects);

    assert!(serve(&server, &lookup(), "/index.html").await.is_none());

    objects.put(ARCHIVE_KEY, archive());
    let other = LookupPath::new(2, PREFIX);
    assert!(serve(&server, &other, "/missing.html").await.is_none());
}

#[tokio::test]
async fn missing_archive_is_probed_once() {
    let objects = ObjectServer::new().await;
    objects.put("group/project/public/index.html", "<h1>loose file</h1>");
    let server = content_server(&objects);

    for _ in 0..10 {
        assert!(serve(&server, &lookup(), "/").await.is_some());
    }
    assert_eq!(objects.requests(ARCHIVE_KEY), 1);
    assert_eq!(server.cache().peek(1).map(|v| v.is_none()), Some(true));

    // an archive uploaded later is not picked up until restart
    objects.put(ARCHIVE_KEY, archive());
    let (content, _) = serve(&server, &lookup(), "/").await.unwrap();
    assert_eq!(content.source, Source::Object);
    assert_eq!(objects.requests(ARCHIVE_KEY), 1);
}

#[tokio::test]
async fn concurrent_requests_build_once() {
    let objects = ObjectServer::new().await;
    objects.put(ARCHIVE_KEY, archive());
    objects.set_delay(Duration::from_millis(50));
    let server = content_server(&objects);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            serve(&server, &lookup(), "index.html").await.unwrap().1
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), b"<h1>from archive</h1>");
    }

    // one size probe and one trailer read, one entry request per response
    assert_eq!(objects.requests_with_range(ARCHIVE_KEY, "bytes=0-0"), 1);
    assert_eq!(objects.requests(ARCHIVE_KEY), 3 + 8);
}

#[tokio::test]
async fn malformed_archive_fails_without_being_cached() {
    let objects = ObjectServer::new().await;
    objects.put(ARCHIVE_KEY, "this is not a zip archive at all");
    objects.put("group/project/public/index.html", "<h1>loose file</h1>");
    let server = content_server(&objects);

    let result = server.serve(&lookup(), "/", &CancellationToken::new()).await;
    let err = result.unwrap_err();
    assert!(matches!(err, Error::MalformedArchive(_)));
    assert!(err.is_server_failure());
    assert!(server.cache().peek(1).is_none());

    // the next request builds again
    objects.put(ARCHIVE_KEY, archive());
    let (content, body) = serve(&server, &lookup(), "/").await.unwrap();
    assert_eq!(content.source, Source::Archive);
    assert_eq!(body, b"<h1>from archive</h1>");
}

#[tokio::test]
async fn archive_name_is_configurable() {
    let objects = ObjectServer::new().await;
    objects.put("group/project/public/site.zip", archive());
    let server = ContentServer::new(
        Arc::new(objects.store()),
        Arc::new(ArchiveCache::new()),
        ServeConfig {
            archive_name: "site.zip".to_string(),
            ..ServeConfig::default()
        },
    );

    let (content, _) = serve(&server, &lookup(), "/").await.unwrap();
    assert_eq!(content.source, Source::Archive);
}

#[tokio::test]
async fn body_streams_into_writer() {
    let objects = ObjectServer::new().await;
    objects.put(ARCHIVE_KEY, archive());
    let server = content_server(&objects);

    let Served::Content(mut content) = server
        .serve(&lookup(), "docs/", &CancellationToken::new())
        .await
        .unwrap()
    else {
        panic!("expected content");
    };
    let mut out = Vec::new();
    let written = content.body.copy_to(&mut out).await.unwrap();
    assert_eq!(written, out.len() as u64);
    assert_eq!(out, b"<p>archived docs</p>");
}
