//! Server-Sent Events endpoint backed by the fan-out pool.
use super::*;

pub(super) async fn handle_stream_connect(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> Response {
    if let Err(error) = authorize_gateway_request(&state, &headers) {
        return error.into_response();
    }
    let client_id = client_id.trim();
    if client_id.is_empty() {
        return GatewayApiError::bad_request("invalid_request", "Missing clientId").into_response();
    }

    let (tx, rx) = mpsc::unbounded_channel::<StreamFrame>();
    state.fanout.register(client_id, tx);
    let stream = UnboundedReceiverStream::new(rx)
        .map(|frame| Ok::<Event, Infallible>(stream_frame_event(frame)));
    let mut response = Sse::new(stream).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn stream_frame_event(frame: StreamFrame) -> Event {
    match frame {
        StreamFrame::Comment(comment) => Event::default().comment(comment),
        StreamFrame::Data(data) => Event::default().data(data),
    }
}
