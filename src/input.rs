use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Action {
    Quit,
    Refresh,
}

pub fn map_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char('r') | KeyCode::F(5) => Some(Action::Refresh),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEvent;

    #[test]
    fn quit_keys_map_to_quit() {
        assert_eq!(map_key(KeyEvent::from(KeyCode::Char('q'))), Some(Action::Quit));
        assert_eq!(map_key(KeyEvent::from(KeyCode::Esc)), Some(Action::Quit));
        assert_eq!(
            map_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Action::Quit)
        );
    }

    #[test]
    fn refresh_keys_map_to_refresh() {
        assert_eq!(
            map_key(KeyEvent::from(KeyCode::Char('r'))),
            Some(Action::Refresh)
        );
        assert_eq!(map_key(KeyEvent::from(KeyCode::F(5))), Some(Action::Refresh));
    }

    #[test]
    fn unbound_keys_map_to_nothing() {
        assert_eq!(map_key(KeyEvent::from(KeyCode::Char('x'))), None);
        assert_eq!(map_key(KeyEvent::from(KeyCode::Enter)), None);
    }
}
