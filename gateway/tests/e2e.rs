//! End-to-end scenarios that need a real `postgres` binary on PATH (or
//! pointed to via `PG_GATEWAY_TEST_BIN_DIR`). Ignored by default so the
//! rest of the suite runs without a PostgreSQL installation; run with
//! `cargo test -- --ignored` on a machine that has one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use gateway::config::{DataDirPolicy, RouterConfig};
use gateway::lifecycle;
use tokio_postgres::NoTls;

fn test_config(port: u16) -> RouterConfig {
    let pg_bin_dir = std::env::var("PG_GATEWAY_TEST_BIN_DIR").ok().map(PathBuf::from);
    RouterConfig {
        listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        data_dir: DataDirPolicy::Ephemeral,
        log_level: "info",
        auto_provision: true,
        max_connections: 1000,
        pg_bin_dir,
    }
}

async fn connect(port: u16, database: &str) -> tokio_postgres::Client {
    let conn_str = format!("host=127.0.0.1 port={port} dbname={database} user=postgres");
    let (client, connection) = tokio_postgres::connect(&conn_str, NoTls).await.expect("connect through gateway");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

#[tokio::test]
#[ignore = "requires a real postgres binary"]
async fn basic_auto_provision() {
    let handle = lifecycle::start(test_config(15432)).await.unwrap();

    let client = connect(15432, "testdb1").await;
    client
        .batch_execute("CREATE TABLE users(id serial primary key, name text)")
        .await
        .unwrap();
    client.execute("INSERT INTO users(name) VALUES ('Alice')", &[]).await.unwrap();

    let rows = client.query("SELECT name FROM users", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<_, String>(0), "Alice");

    let stats = handle.stats().await;
    assert!(stats.databases.iter().any(|d| d == "testdb1"));

    handle.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a real postgres binary"]
async fn isolation_between_databases() {
    let handle = lifecycle::start(test_config(15433)).await.unwrap();

    let a = connect(15433, "db1").await;
    a.batch_execute("CREATE TABLE users(id serial primary key, name text)").await.unwrap();
    a.execute("INSERT INTO users(name) VALUES ('Alice')", &[]).await.unwrap();
    drop(a);

    let b = connect(15433, "db2").await;
    b.batch_execute("CREATE TABLE posts(id serial primary key, title text)").await.unwrap();
    b.execute("INSERT INTO posts(title) VALUES ('Hello World')", &[]).await.unwrap();
    drop(b);

    let a2 = connect(15433, "db1").await;
    let rows = a2.query("SELECT name FROM users", &[]).await.unwrap();
    assert_eq!(rows[0].get::<_, String>(0), "Alice");
    assert!(a2.query("SELECT * FROM posts", &[]).await.is_err());

    handle.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a real postgres binary"]
async fn reuse_after_disconnect() {
    let handle = lifecycle::start(test_config(15434)).await.unwrap();

    let c1 = connect(15434, "reuse-test").await;
    c1.batch_execute("CREATE TABLE test(value int)").await.unwrap();
    c1.execute("INSERT INTO test(value) VALUES (42)", &[]).await.unwrap();
    drop(c1);

    let c2 = connect(15434, "reuse-test").await;
    let rows = c2.query("SELECT value FROM test", &[]).await.unwrap();
    assert_eq!(rows[0].get::<_, i32>(0), 42);

    let stats = handle.stats().await;
    assert_eq!(stats.databases.iter().filter(|d| *d != "postgres").count(), 1);

    handle.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a real postgres binary"]
async fn backpressure_large_insert() {
    let handle = lifecycle::start(test_config(15435)).await.unwrap();
    let client = connect(15435, "bp_insert").await;
    client.batch_execute("CREATE TABLE big(id serial primary key, payload text)").await.unwrap();

    let payload: String = "x".repeat(360_000);
    client.execute("INSERT INTO big(payload) VALUES ($1)", &[&payload]).await.unwrap();

    let row = client.query_one("SELECT length(payload) FROM big", &[]).await.unwrap();
    assert_eq!(row.get::<_, i32>(0), 360_000);

    handle.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a real postgres binary"]
async fn backpressure_large_select() {
    let handle = lifecycle::start(test_config(15436)).await.unwrap();
    let client = connect(15436, "bp_select").await;
    client.batch_execute("CREATE TABLE wide(data text)").await.unwrap();

    let value: String = "y".repeat(10_000);
    for _ in 0..60 {
        client.execute("INSERT INTO wide(data) VALUES ($1)", &[&value]).await.unwrap();
    }

    let rows = client.query("SELECT data FROM wide", &[]).await.unwrap();
    assert_eq!(rows.len(), 60);
    assert!(rows.iter().all(|r| r.get::<_, String>(0).len() == 10_000));

    handle.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a real postgres binary"]
async fn concurrent_large_operations() {
    let handle = lifecycle::start(test_config(15437)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(tokio::spawn(async move {
            let client = connect(15437, &format!("concurrent_{i}")).await;
            client.batch_execute("CREATE TABLE blob(payload text)").await.unwrap();
            let payload: String = "z".repeat(300_000);
            client.execute("INSERT INTO blob(payload) VALUES ($1)", &[&payload]).await.unwrap();
            let row = client.query_one("SELECT length(payload) FROM blob", &[]).await.unwrap();
            assert_eq!(row.get::<_, i32>(0), 300_000);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    handle.stop().await.unwrap();
}
