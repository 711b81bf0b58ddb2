//! `ClusterMembershipStates` (spec §4.B): reads SWIM membership state off
//! a length-delimited JSON-framed admin socket.

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use uncloud_util::time::ntp64_to_wall;
use uncloud_util::{Error, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
	Alive,
	Suspect,
	Down,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMember {
	id: String,
	state: MemberState,
	/// NTP-64 timestamp: upper 32 bits seconds, lower 32 bits fraction.
	timestamp_ntp64: u64,
}

#[derive(Debug, Clone)]
pub struct MembershipMember {
	pub id: String,
	pub state: MemberState,
	pub timestamp_secs: u64,
	pub timestamp_nsecs: u32,
}

#[derive(Debug, Deserialize)]
struct RawMembershipResponse {
	members: Vec<RawMember>,
}

#[derive(Debug, Deserialize)]
struct AdminErrorBody {
	msg: String,
}

#[derive(Debug, Deserialize)]
struct AdminErrorFrame {
	#[serde(rename = "Error")]
	error: AdminErrorBody,
}

/// One frame of the admin socket's reply stream: zero or more data
/// frames, terminated by either the JSON string `"Success"` or an
/// `{"Error": {"msg": ...}}` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AdminFrame {
	Error(AdminErrorFrame),
	Data(RawMembershipResponse),
	Success(String),
}

#[derive(serde::Serialize)]
struct MembershipRequest {
	cmd: &'static str,
	latest: bool,
}

/// Read frames off the socket until the terminal sentinel, accumulating
/// members from every data frame in between.
pub async fn cluster_membership_states(
	socket_path: &str,
	latest: bool,
) -> Result<Vec<MembershipMember>, Error> {
	let mut stream = UnixStream::connect(socket_path)
		.await
		.map_err(|e| Error::new(ErrorKind::StoreUnavailable, e))?;

	let request = serde_json::to_vec(&MembershipRequest { cmd: "cluster_membership_states", latest })?;
	write_frame(&mut stream, &request).await?;

	let mut members = Vec::new();
	loop {
		let frame = read_frame(&mut stream).await?;
		match serde_json::from_slice::<AdminFrame>(&frame)? {
			AdminFrame::Success(_) => break,
			AdminFrame::Error(e) => {
				return Err(Error::msg(ErrorKind::StoreProtocol, e.error.msg));
			}
			AdminFrame::Data(raw) => {
				members.extend(raw.members.into_iter().map(|m| {
					let (secs, nsecs) = ntp64_to_wall(m.timestamp_ntp64);
					MembershipMember {
						id: m.id,
						state: m.state,
						timestamp_secs: secs,
						timestamp_nsecs: nsecs,
					}
				}));
			}
		}
	}

	Ok(members)
}

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<(), Error> {
	let len = payload.len() as u32;
	stream
		.write_all(&len.to_be_bytes())
		.await
		.map_err(|e| Error::new(ErrorKind::StoreUnavailable, e))?;
	stream
		.write_all(payload)
		.await
		.map_err(|e| Error::new(ErrorKind::StoreUnavailable, e))?;
	Ok(())
}

async fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>, Error> {
	let mut len_buf = [0u8; 4];
	stream
		.read_exact(&mut len_buf)
		.await
		.map_err(|e| Error::new(ErrorKind::StoreUnavailable, e))?;
	let len = u32::from_be_bytes(len_buf);
	if len > MAX_FRAME_LEN {
		return Err(Error::msg(
			ErrorKind::StoreProtocol,
			format!("admin socket frame too large: {len} bytes"),
		));
	}
	let mut buf = vec![0u8; len as usize];
	stream
		.read_exact(&mut buf)
		.await
		.map_err(|e| Error::new(ErrorKind::StoreUnavailable, e))?;
	Ok(buf)
}

#[cfg(test)]
mod test {
	use super::*;
	use tokio::net::UnixListener;

	#[tokio::test]
	async fn roundtrips_framed_request_response() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("admin.sock");
		let listener = UnixListener::bind(&path).unwrap();

		let server = tokio::spawn({
			let path = path.clone();
			async move {
				let (mut sock, _) = listener.accept().await.unwrap();
				let _req = read_frame(&mut sock).await.unwrap();
				let body = serde_json::to_vec(&serde_json::json!({
					"members": [
						{"id": "m1", "state": "alive", "timestamp_ntp64": (10u64 << 32)},
					]
				}))
				.unwrap();
				write_frame(&mut sock, &body).await.unwrap();
				write_frame(&mut sock, &serde_json::to_vec("Success").unwrap()).await.unwrap();
				let _ = path;
			}
		});

		let members = cluster_membership_states(path.to_str().unwrap(), true).await.unwrap();
		server.await.unwrap();

		assert_eq!(members.len(), 1);
		assert_eq!(members[0].id, "m1");
		assert_eq!(members[0].state, MemberState::Alive);
		assert_eq!(members[0].timestamp_secs, 10);
	}

	#[tokio::test]
	async fn accumulates_multiple_data_frames_before_success() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("admin.sock");
		let listener = UnixListener::bind(&path).unwrap();

		let server = tokio::spawn({
			let path = path.clone();
			async move {
				let (mut sock, _) = listener.accept().await.unwrap();
				let _req = read_frame(&mut sock).await.unwrap();
				for id in ["m1", "m2"] {
					let body = serde_json::to_vec(&serde_json::json!({
						"members": [{"id": id, "state": "suspect", "timestamp_ntp64": (5u64 << 32)}]
					}))
					.unwrap();
					write_frame(&mut sock, &body).await.unwrap();
				}
				write_frame(&mut sock, &serde_json::to_vec("Success").unwrap()).await.unwrap();
				let _ = path;
			}
		});

		let members = cluster_membership_states(path.to_str().unwrap(), false).await.unwrap();
		server.await.unwrap();

		assert_eq!(members.len(), 2);
		assert_eq!(members[1].id, "m2");
	}

	#[tokio::test]
	async fn propagates_error_sentinel() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("admin.sock");
		let listener = UnixListener::bind(&path).unwrap();

		let server = tokio::spawn({
			let path = path.clone();
			async move {
				let (mut sock, _) = listener.accept().await.unwrap();
				let _req = read_frame(&mut sock).await.unwrap();
				let body = serde_json::to_vec(&serde_json::json!({"Error": {"msg": "no such table"}})).unwrap();
				write_frame(&mut sock, &body).await.unwrap();
				let _ = path;
			}
		});

		let result = cluster_membership_states(path.to_str().unwrap(), false).await;
		server.await.unwrap();

		let err = result.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::StoreProtocol);
	}
}
