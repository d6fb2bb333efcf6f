/* Command handler stack: frames are consulted top-down until one reports
 * the command handled. */
use crate::command::Command;

pub enum Propagation {
    Handled,
    Unhandled,
}

/* A single handler frame. `data` is handler-private state threaded through
 * every call; `on_command` returns whether it consumed the command. */
pub struct HandlerFrame {
    pub name: String,
    pub context: crate::keytable::Context,
    pub on_command: Box<dyn FnMut(&mut dyn std::any::Any, Command) -> Propagation>,
    pub data: Box<dyn std::any::Any>,
}

#[derive(Default)]
pub struct HandlerStack {
    frames: Vec<HandlerFrame>,
}

impl HandlerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: HandlerFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<HandlerFrame> {
        self.frames.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn top_context(&self) -> Option<crate::keytable::Context> {
        self.frames.last().map(|f| f.context)
    }

    /* Walk the stack top-down, stopping at the first frame that reports
     * `Handled`. Returns whether any frame handled the command. */
    pub fn dispatch(&mut self, command: Command) -> bool {
        for frame in self.frames.iter_mut().rev() {
            match (frame.on_command)(frame.data.as_mut(), command) {
                Propagation::Handled => return true,
                Propagation::Unhandled => continue,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Block;
    use crate::keytable::Context;

    fn frame(name: &str, handles: bool, log: std::rc::Rc<std::cell::RefCell<Vec<String>>>) -> HandlerFrame {
        HandlerFrame {
            name: name.to_string(),
            context: Context::Default,
            on_command: Box::new(move |_data, _cmd| {
                log.borrow_mut().push(name.to_string());
                if handles {
                    Propagation::Handled
                } else {
                    Propagation::Unhandled
                }
            }),
            data: Box::new(()),
        }
    }

    #[test]
    fn top_frame_sees_command_first() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut stack = HandlerStack::new();
        stack.push(frame("base", true, log.clone()));
        stack.push(frame("overlay", false, log.clone()));

        let handled = stack.dispatch(Command::new(Block::LnUp, 0, 0));
        assert!(handled);
        assert_eq!(*log.borrow(), vec!["overlay", "base"]);
    }

    #[test]
    fn handled_frame_stops_propagation() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut stack = HandlerStack::new();
        stack.push(frame("base", true, log.clone()));
        stack.push(frame("overlay", true, log.clone()));

        stack.dispatch(Command::new(Block::LnUp, 0, 0));
        assert_eq!(*log.borrow(), vec!["overlay"]);
    }

    #[test]
    fn empty_stack_reports_unhandled() {
        let mut stack = HandlerStack::new();
        assert!(!stack.dispatch(Command::new(Block::LnUp, 0, 0)));
    }
}
