//! File tree sync against the simulated backend.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use preview_sandbox::error::AppError;
use preview_sandbox::registry::ProjectKind;
use preview_sandbox::workspace::{self, Encoding, FileNode, NodeKind};

use super::test_helpers::simulated_harness;

#[tokio::test]
async fn written_tree_reads_back_identically() {
    let h = simulated_harness();
    h.provisioner
        .create(Some("files"), ProjectKind::Node)
        .await
        .unwrap();

    let binary = vec![0xff, 0x00, 0xfe, 0x10];
    let tree = vec![
        FileNode::file("package.json", r#"{"name":"demo"}"#),
        FileNode::folder(
            "src",
            vec![
                FileNode::file("index.js", "console.log('hi')\n"),
                FileNode::folder("empty", vec![]),
            ],
        ),
        FileNode {
            name: "logo.bin".into(),
            kind: NodeKind::File,
            content: Some(BASE64.encode(&binary)),
            encoding: Some(Encoding::Base64),
            children: None,
        },
    ];

    let written = workspace::write_tree(&h.provisioner, "files", &tree)
        .await
        .unwrap();
    assert_eq!(written, 3);

    let read = workspace::read_tree(&h.provisioner, "files").await.unwrap();
    let names: Vec<&str> = read.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["logo.bin", "package.json", "src"]);

    assert_eq!(read[0].encoding, Some(Encoding::Base64));
    assert_eq!(
        BASE64.decode(read[0].content.as_deref().unwrap()).unwrap(),
        binary
    );
    assert_eq!(read[1], tree[0]);
    assert_eq!(
        read[2],
        FileNode::folder(
            "src",
            vec![
                FileNode::folder("empty", vec![]),
                FileNode::file("index.js", "console.log('hi')\n"),
            ],
        )
    );
}

#[tokio::test]
async fn sync_overwrites_existing_files() {
    let h = simulated_harness();
    h.provisioner
        .create(Some("overwrite"), ProjectKind::Static)
        .await
        .unwrap();
    for body in ["v1", "v2"] {
        workspace::write_tree(&h.provisioner, "overwrite", &[FileNode::file("index.html", body)])
            .await
            .unwrap();
    }
    let read = workspace::read_tree(&h.provisioner, "overwrite").await.unwrap();
    assert_eq!(read, vec![FileNode::file("index.html", "v2")]);
}

#[tokio::test]
async fn traversal_names_are_rejected_before_writing() {
    let h = simulated_harness();
    h.provisioner
        .create(Some("escape"), ProjectKind::Node)
        .await
        .unwrap();
    let tree = vec![
        FileNode::file("ok.txt", "fine"),
        FileNode::file("../outside.txt", "nope"),
    ];
    let result = workspace::write_tree(&h.provisioner, "escape", &tree).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));

    // Validation runs over the whole tree first, so nothing was written.
    let read = workspace::read_tree(&h.provisioner, "escape").await.unwrap();
    assert!(read.is_empty());
    assert!(!h.temp.path().join("outside.txt").exists());
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let h = simulated_harness();
    let result = workspace::write_tree(&h.provisioner, "nobody", &[]).await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
    let result = workspace::read_tree(&h.provisioner, "nobody").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn removed_workspace_reports_not_found() {
    let h = simulated_harness();
    let provisioned = h
        .provisioner
        .create(Some("swept"), ProjectKind::Static)
        .await
        .unwrap();
    std::fs::remove_dir_all(h.temp.path().join(provisioned.environment_id.name())).unwrap();

    let result = workspace::read_tree(&h.provisioner, "swept").await;
    assert!(matches!(result, Err(AppError::NotFound(_))), "{result:?}");
    assert!(h.provisioner.registry().get("swept").await.is_none());
}
