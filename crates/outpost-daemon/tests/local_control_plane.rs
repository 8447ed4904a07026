//! Control-plane round trip: preload the store over IPC, queue a local
//! deployment, watch it converge, and inspect the resulting topology.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use outpost_core::deployment::{DeploymentDirectoryManager, GroupRootsStore, LocalOverrideRequest};
use outpost_core::ipc::{
    frame_message, parse_frame_length, IpcRequest, IpcResponse, LocalDeploymentState,
};
use outpost_core::store::ComponentStore;
use outpost_core::supervisor::{ImmediateLauncher, Supervisor};
use outpost_daemon::ipc_server;
use outpost_daemon::orchestrator::DeploymentLane;
use outpost_daemon::state::{DaemonStateHandle, SharedState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

fn build_state(root: &Path) -> SharedState {
    let store = ComponentStore::open(root).unwrap();
    let groups = GroupRootsStore::load(root).unwrap();
    let directories = DeploymentDirectoryManager::open(root).unwrap();
    let supervisor = Supervisor::new(root, Arc::new(ImmediateLauncher));
    Arc::new(DaemonStateHandle::new(
        root,
        supervisor,
        groups,
        store,
        directories,
    ))
}

async fn request(stream: &mut UnixStream, request: &IpcRequest) -> IpcResponse {
    let payload = serde_json::to_vec(request).unwrap();
    stream.write_all(&frame_message(&payload)).await.unwrap();
    stream.flush().await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = parse_frame_length(&len_buf).unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_preload_deploy_and_inspect() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    std::fs::create_dir_all(&root).unwrap();

    // recipes waiting on disk for preload
    let recipe_dir = tmp.path().join("recipes");
    std::fs::create_dir_all(&recipe_dir).unwrap();
    std::fs::write(
        recipe_dir.join("HelloWorld-1.0.0.yaml"),
        "ComponentName: HelloWorld\nComponentVersion: 1.0.0\nLifecycle:\n  run: sleep 1000\n",
    )
    .unwrap();

    let state = build_state(&root);
    let socket = root.join("outpostd.sock");

    let lane = DeploymentLane::new(state.clone(), Duration::from_secs(30));
    let queue = lane.queue.clone();
    tokio::spawn(lane.run());

    let server_state = state.clone();
    let server_socket = socket.clone();
    tokio::spawn(async move {
        let _ = ipc_server::run(&server_socket, server_state, queue).await;
    });

    // wait for the socket to appear
    for _ in 0..50 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut stream = UnixStream::connect(&socket).await.unwrap();

    // empty topology at first
    let response = request(&mut stream, &IpcRequest::ListComponents).await;
    match response {
        IpcResponse::ComponentList(components) => assert!(components.is_empty()),
        other => panic!("unexpected response: {other:?}"),
    }

    // preload the store
    let response = request(
        &mut stream,
        &IpcRequest::UpdateRecipesAndArtifacts {
            recipe_dir: recipe_dir.display().to_string(),
            artifact_dir: None,
        },
    )
    .await;
    assert!(matches!(response, IpcResponse::Ok));

    // queue a local deployment of the preloaded component
    let deployment_id = match request(
        &mut stream,
        &IpcRequest::CreateLocalDeployment(LocalOverrideRequest {
            root_component_versions_to_add: [(
                "HelloWorld".to_string(),
                semver::Version::new(1, 0, 0),
            )]
            .into(),
            ..Default::default()
        }),
    )
    .await
    {
        IpcResponse::LocalDeploymentQueued { deployment_id } => deployment_id,
        other => panic!("unexpected response: {other:?}"),
    };

    // poll until the lane finishes it
    let mut final_state = LocalDeploymentState::Queued;
    for _ in 0..100 {
        let response = request(
            &mut stream,
            &IpcRequest::GetLocalDeploymentStatus {
                deployment_id: deployment_id.clone(),
            },
        )
        .await;
        match response {
            IpcResponse::LocalDeploymentStatus(record) => {
                final_state = record.state;
                if matches!(
                    final_state,
                    LocalDeploymentState::Succeeded | LocalDeploymentState::Failed
                ) {
                    break;
                }
            },
            other => panic!("unexpected response: {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(final_state, LocalDeploymentState::Succeeded);

    // the component is now visible with its running state
    let response = request(
        &mut stream,
        &IpcRequest::GetComponentDetails {
            name: "HelloWorld".to_string(),
        },
    )
    .await;
    match response {
        IpcResponse::ComponentDetails(details) => {
            assert_eq!(details.version.as_deref(), Some("1.0.0"));
            assert_eq!(details.state, outpost_core::lifecycle::ServiceState::Running);
        },
        other => panic!("unexpected response: {other:?}"),
    }

    // history lists it newest first
    let response = request(&mut stream, &IpcRequest::ListLocalDeployments).await;
    match response {
        IpcResponse::LocalDeployments(records) => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].deployment_id, deployment_id);
        },
        other => panic!("unexpected response: {other:?}"),
    }

    state.request_shutdown();
}
