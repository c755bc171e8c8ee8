//! Translates remote-control input events into `Input.dispatch*` CDP
//! commands, preserving held-modifier state across events.

use std::sync::Arc;

use glimpse_core::errors::CdpError;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::session::CdpSession;

const MOD_ALT: u32 = 1;
const MOD_CTRL: u32 = 2;
const MOD_META: u32 = 4;
const MOD_SHIFT: u32 = 8;

fn payload_bool(payload: &Map<String, Value>, keys: &[&str]) -> bool {
    for key in keys {
        if let Some(Value::Bool(b)) = payload.get(*key) {
            return *b;
        }
    }
    false
}

fn modifiers_from_payload(payload: &Map<String, Value>) -> u32 {
    if let Some(explicit) = payload.get("modifiers").and_then(Value::as_u64) {
        return explicit as u32;
    }
    let mut modifiers = 0;
    if payload_bool(payload, &["alt", "altKey"]) {
        modifiers |= MOD_ALT;
    }
    if payload_bool(payload, &["ctrl", "ctrlKey", "control"]) {
        modifiers |= MOD_CTRL;
    }
    if payload_bool(payload, &["meta", "metaKey"]) {
        modifiers |= MOD_META;
    }
    if payload_bool(payload, &["shift", "shiftKey"]) {
        modifiers |= MOD_SHIFT;
    }
    modifiers
}

fn special_vkey(key: &str) -> Option<u32> {
    Some(match key {
        "Backspace" => 8,
        "Tab" => 9,
        "Enter" => 13,
        "Shift" => 16,
        "Control" => 17,
        "Alt" => 18,
        "Pause" => 19,
        "CapsLock" => 20,
        "Escape" => 27,
        "Space" => 32,
        "PageUp" => 33,
        "PageDown" => 34,
        "End" => 35,
        "Home" => 36,
        "ArrowLeft" => 37,
        "ArrowUp" => 38,
        "ArrowRight" => 39,
        "ArrowDown" => 40,
        "Insert" => 45,
        "Delete" => 46,
        "Meta" => 91,
        _ => return None,
    })
}

fn virtual_key_code(key: &str) -> u32 {
    if let Some(vkey) = special_vkey(key) {
        return vkey;
    }
    let mut chars = key.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_alphabetic() {
            return c.to_ascii_uppercase() as u32;
        }
        if c.is_ascii() {
            return c as u32;
        }
    }
    0
}

fn default_code_for_key(key: &str) -> Option<String> {
    if key == " " || key == "Space" {
        return Some("Space".to_string());
    }
    if special_vkey(key).is_some() {
        return Some(key.to_string());
    }
    let mut chars = key.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_alphabetic() {
            return Some(format!("Key{}", c.to_ascii_uppercase()));
        }
        if c.is_ascii_digit() {
            return Some(format!("Digit{c}"));
        }
    }
    None
}

fn mouse_button(button: &str) -> &'static str {
    match button {
        "right" => "right",
        "middle" => "middle",
        _ => "left",
    }
}

fn modifier_bit_for_key(key: &str, code: &str) -> u32 {
    let key = key.trim();
    let code = code.trim();
    if key == "Shift" || code.starts_with("Shift") {
        return MOD_SHIFT;
    }
    if key == "Control" || key == "Ctrl" || code.starts_with("Control") {
        return MOD_CTRL;
    }
    if key == "Alt" || code.starts_with("Alt") {
        return MOD_ALT;
    }
    if key == "Meta" || code.starts_with("Meta") || code.starts_with("OS") {
        return MOD_META;
    }
    0
}

enum KeyDirection {
    Down,
    Up,
}

/// Stateful input dispatcher. Modifier keys pressed in one event stay
/// applied to later mouse and key events until their matching keyup.
pub struct InputDispatcher {
    session: Mutex<Arc<dyn CdpSession>>,
    held: Mutex<u32>,
}

impl InputDispatcher {
    pub fn new(session: Arc<dyn CdpSession>) -> Self {
        Self {
            session: Mutex::new(session),
            held: Mutex::new(0),
        }
    }

    /// Swap the underlying session handle after a detach. Held
    /// modifiers survive the swap.
    pub fn replace_session(&self, session: Arc<dyn CdpSession>) {
        *self.session.lock() = session;
    }

    /// Currently held modifier bitmask.
    pub fn held_modifiers(&self) -> u32 {
        *self.held.lock()
    }

    /// Dispatch one validated control input event.
    pub async fn dispatch(
        &self,
        event: &str,
        payload: &Value,
        cdp_session_id: Option<&str>,
    ) -> Result<(), CdpError> {
        let payload = payload.as_object().cloned().unwrap_or_default();
        let key = payload.get("key").and_then(Value::as_str).unwrap_or("");
        let code = payload.get("code").and_then(Value::as_str).unwrap_or("");
        let bit = modifier_bit_for_key(key, code);

        let held = {
            let mut held = self.held.lock();
            if bit != 0 {
                match event {
                    "input_keydown" => *held |= bit,
                    "input_keyup" => *held &= !bit,
                    _ => {}
                }
            }
            *held
        };

        let mut modifiers = held | modifiers_from_payload(&payload);
        if bit != 0 {
            match event {
                "input_keyup" => modifiers &= !bit,
                "input_keydown" => modifiers |= bit,
                _ => {}
            }
        }

        match event {
            "input_move" | "input_click" | "input_wheel" => {
                self.mouse_event(event, &payload, modifiers, cdp_session_id)
                    .await
            }
            "input_keydown" => {
                self.key_event(KeyDirection::Down, &payload, modifiers, cdp_session_id)
                    .await
            }
            "input_keyup" => {
                self.key_event(KeyDirection::Up, &payload, modifiers, cdp_session_id)
                    .await
            }
            "input_type" => self.type_text(&payload, modifiers, cdp_session_id).await,
            other => {
                tracing::debug!(event = other, "unhandled ctrl input event");
                Ok(())
            }
        }
    }

    async fn mouse_event(
        &self,
        event: &str,
        payload: &Map<String, Value>,
        modifiers: u32,
        cdp_session_id: Option<&str>,
    ) -> Result<(), CdpError> {
        let x = payload.get("x").and_then(Value::as_f64).unwrap_or(0.0);
        let y = payload.get("y").and_then(Value::as_f64).unwrap_or(0.0);

        if event == "input_move" {
            return self
                .send_input(
                    "Input.dispatchMouseEvent",
                    json!({"type": "mouseMoved", "x": x, "y": y, "modifiers": modifiers}),
                    cdp_session_id,
                )
                .await;
        }

        if event == "input_wheel" {
            let delta_x = payload.get("delta_x").and_then(Value::as_f64).unwrap_or(0.0);
            let delta_y = payload.get("delta_y").and_then(Value::as_f64).unwrap_or(0.0);
            return self
                .send_input(
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": "mouseWheel",
                        "x": x,
                        "y": y,
                        "deltaX": delta_x,
                        "deltaY": delta_y,
                        "modifiers": modifiers,
                    }),
                    cdp_session_id,
                )
                .await;
        }

        let button = mouse_button(payload.get("button").and_then(Value::as_str).unwrap_or("left"));
        let click_count = payload
            .get("click_count")
            .and_then(Value::as_u64)
            .filter(|c| *c > 0)
            .unwrap_or(1);
        for kind in ["mousePressed", "mouseReleased"] {
            self.send_input(
                "Input.dispatchMouseEvent",
                json!({
                    "type": kind,
                    "x": x,
                    "y": y,
                    "button": button,
                    "clickCount": click_count,
                    "modifiers": modifiers,
                }),
                cdp_session_id,
            )
            .await?;
        }
        Ok(())
    }

    async fn key_event(
        &self,
        direction: KeyDirection,
        payload: &Map<String, Value>,
        modifiers: u32,
        cdp_session_id: Option<&str>,
    ) -> Result<(), CdpError> {
        let key = payload.get("key").and_then(Value::as_str).unwrap_or("");
        if key.is_empty() {
            return Ok(());
        }

        let code = payload
            .get("code")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .or_else(|| default_code_for_key(key));
        let auto_repeat = payload.get("repeat").and_then(Value::as_bool);

        let vkey = virtual_key_code(key);
        let mut base = json!({
            "key": key,
            "code": code,
            "modifiers": modifiers,
            "windowsVirtualKeyCode": vkey,
            "nativeVirtualKeyCode": vkey,
        });
        if let Some(repeat) = auto_repeat {
            base["autoRepeat"] = Value::Bool(repeat);
        }

        if matches!(direction, KeyDirection::Up) {
            base["type"] = "keyUp".into();
            return self
                .send_input("Input.dispatchKeyEvent", base, cdp_session_id)
                .await;
        }

        if key == "Enter" {
            // Enter needs rawKeyDown plus an explicit carriage-return
            // char event or the page never sees a keypress.
            base["type"] = "rawKeyDown".into();
            let code = base["code"].clone();
            self.send_input("Input.dispatchKeyEvent", base, cdp_session_id)
                .await?;
            return self
                .send_input(
                    "Input.dispatchKeyEvent",
                    json!({
                        "type": "char",
                        "text": "\r",
                        "unmodifiedText": "\r",
                        "modifiers": modifiers,
                        "windowsVirtualKeyCode": vkey,
                        "nativeVirtualKeyCode": vkey,
                        "key": key,
                        "code": code,
                    }),
                    cdp_session_id,
                )
                .await;
        }

        base["type"] = if special_vkey(key).is_some() {
            "rawKeyDown".into()
        } else {
            "keyDown".into()
        };
        self.send_input("Input.dispatchKeyEvent", base, cdp_session_id)
            .await
    }

    async fn type_text(
        &self,
        payload: &Map<String, Value>,
        modifiers: u32,
        cdp_session_id: Option<&str>,
    ) -> Result<(), CdpError> {
        let Some(text) = payload.get("text").and_then(Value::as_str) else {
            return Ok(());
        };
        if text.is_empty() {
            return Ok(());
        }

        for ch in text.chars() {
            if ch == '\n' || ch == '\r' {
                let enter: Map<String, Value> = json!({"key": "Enter"})
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                self.key_event(KeyDirection::Down, &enter, modifiers, cdp_session_id)
                    .await?;
                self.key_event(KeyDirection::Up, &enter, modifiers, cdp_session_id)
                    .await?;
                continue;
            }

            let text = ch.to_string();
            let vkey = virtual_key_code(&text);
            let mut params = json!({
                "type": "char",
                "text": text,
                "unmodifiedText": text,
                "modifiers": modifiers,
            });
            if vkey != 0 {
                params["windowsVirtualKeyCode"] = vkey.into();
                params["nativeVirtualKeyCode"] = vkey.into();
                params["key"] = text.clone().into();
                params["code"] = default_code_for_key(&text).into();
            }
            self.send_input("Input.dispatchKeyEvent", params, cdp_session_id)
                .await?;
        }
        Ok(())
    }

    async fn send_input(
        &self,
        method: &str,
        params: Value,
        cdp_session_id: Option<&str>,
    ) -> Result<(), CdpError> {
        let session = Arc::clone(&*self.session.lock());
        session.send(method, Some(params), cdp_session_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockSession;

    fn dispatcher() -> (Arc<MockSession>, InputDispatcher) {
        let mock = Arc::new(MockSession::new());
        let dispatcher = InputDispatcher::new(mock.clone() as Arc<dyn CdpSession>);
        (mock, dispatcher)
    }

    #[tokio::test]
    async fn held_shift_applies_to_later_clicks() {
        let (mock, dispatcher) = dispatcher();
        dispatcher
            .dispatch("input_keydown", &json!({"key": "Shift"}), None)
            .await
            .unwrap();
        dispatcher
            .dispatch("input_click", &json!({"x": 10.0, "y": 20.0}), None)
            .await
            .unwrap();
        dispatcher
            .dispatch("input_keyup", &json!({"key": "Shift"}), None)
            .await
            .unwrap();
        dispatcher
            .dispatch("input_click", &json!({"x": 10.0, "y": 20.0}), None)
            .await
            .unwrap();

        let clicks = mock.sent("Input.dispatchMouseEvent");
        assert_eq!(clicks.len(), 4);
        let shifted = clicks[0].params.as_ref().unwrap();
        assert_eq!(shifted["type"], "mousePressed");
        assert_eq!(shifted["modifiers"], 8);
        let plain = clicks[2].params.as_ref().unwrap();
        assert_eq!(plain["modifiers"], 0);
    }

    #[tokio::test]
    async fn keyup_clears_its_own_modifier_bit() {
        let (mock, dispatcher) = dispatcher();
        dispatcher
            .dispatch("input_keydown", &json!({"key": "Control"}), None)
            .await
            .unwrap();
        dispatcher
            .dispatch("input_keyup", &json!({"key": "Control"}), None)
            .await
            .unwrap();

        let keys = mock.sent("Input.dispatchKeyEvent");
        let up = keys[1].params.as_ref().unwrap();
        assert_eq!(up["type"], "keyUp");
        assert_eq!(up["modifiers"], 0);
        assert_eq!(dispatcher.held_modifiers(), 0);
    }

    #[tokio::test]
    async fn enter_sends_raw_keydown_then_char() {
        let (mock, dispatcher) = dispatcher();
        dispatcher
            .dispatch("input_keydown", &json!({"key": "Enter"}), None)
            .await
            .unwrap();

        let keys = mock.sent("Input.dispatchKeyEvent");
        assert_eq!(keys.len(), 2);
        let raw = keys[0].params.as_ref().unwrap();
        assert_eq!(raw["type"], "rawKeyDown");
        assert_eq!(raw["windowsVirtualKeyCode"], 13);
        let ch = keys[1].params.as_ref().unwrap();
        assert_eq!(ch["type"], "char");
        assert_eq!(ch["text"], "\r");
    }

    #[tokio::test]
    async fn type_expands_chars_and_newlines() {
        let (mock, dispatcher) = dispatcher();
        dispatcher
            .dispatch("input_type", &json!({"text": "hi\n"}), None)
            .await
            .unwrap();

        let keys = mock.sent("Input.dispatchKeyEvent");
        // h, i, then Enter as rawKeyDown + char + keyUp.
        assert_eq!(keys.len(), 5);
        let h = keys[0].params.as_ref().unwrap();
        assert_eq!(h["type"], "char");
        assert_eq!(h["text"], "h");
        assert_eq!(h["code"], "KeyH");
        assert_eq!(keys[2].params.as_ref().unwrap()["type"], "rawKeyDown");
        assert_eq!(keys[4].params.as_ref().unwrap()["type"], "keyUp");
    }

    #[tokio::test]
    async fn wheel_carries_deltas() {
        let (mock, dispatcher) = dispatcher();
        dispatcher
            .dispatch(
                "input_wheel",
                &json!({"x": 5.0, "y": 6.0, "delta_x": 0.0, "delta_y": -120.0}),
                Some("cdp-9"),
            )
            .await
            .unwrap();

        let wheel = mock.sent("Input.dispatchMouseEvent");
        let params = wheel[0].params.as_ref().unwrap();
        assert_eq!(params["type"], "mouseWheel");
        assert_eq!(params["deltaY"], -120.0);
        assert_eq!(wheel[0].session_id.as_deref(), Some("cdp-9"));
    }

    #[tokio::test]
    async fn keydown_without_key_is_ignored() {
        let (mock, dispatcher) = dispatcher();
        dispatcher
            .dispatch("input_keydown", &json!({}), None)
            .await
            .unwrap();
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn vkey_table_spot_checks() {
        assert_eq!(virtual_key_code("Escape"), 27);
        assert_eq!(virtual_key_code("ArrowDown"), 40);
        assert_eq!(virtual_key_code("a"), 65);
        assert_eq!(virtual_key_code("Z"), 90);
        assert_eq!(virtual_key_code("7"), 55);
        assert_eq!(virtual_key_code("é"), 0);
    }

    #[test]
    fn default_codes() {
        assert_eq!(default_code_for_key(" ").as_deref(), Some("Space"));
        assert_eq!(default_code_for_key("q").as_deref(), Some("KeyQ"));
        assert_eq!(default_code_for_key("3").as_deref(), Some("Digit3"));
        assert_eq!(default_code_for_key("ArrowLeft").as_deref(), Some("ArrowLeft"));
        assert_eq!(default_code_for_key("!"), None);
    }

    #[test]
    fn explicit_modifiers_override_flags() {
        let payload = json!({"modifiers": 6, "shift": true})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(modifiers_from_payload(&payload), 6);
    }
}
