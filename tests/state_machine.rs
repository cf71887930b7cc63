use conclave::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct GoDeep;
struct Cancel;
struct Reenter;
struct Leave;
struct Probe;

/// Console-style dialog machine: `dialog` keeps deep history over a nested
/// code-selection subtree.
struct Console {
    journal: Arc<Mutex<Vec<String>>>,
}

struct ConsoleStates {
    dialog: State,
    wait_activity: State,
    secret_code: State,
    idle: State,
}

impl Console {
    fn record(&self, ctx: &AgentContext) {
        let name = ctx
            .state_name(ctx.current_state())
            .expect("current state exists");
        self.journal.lock().unwrap().push(name);
    }

    fn build_states(ctx: &AgentContext) -> Result<ConsoleStates> {
        let dialog = ctx.state("dialog").deep_history().build()?;
        let wait_activity = ctx.state("wait_activity").child_of(dialog).build()?;
        let number_selection = ctx.state("number_selection").child_of(dialog).build()?;
        let special = ctx.state("special_code_selection").child_of(dialog).build()?;
        let user_code = ctx.state("user_code_selection").child_of(special).build()?;
        let apartment = ctx.state("apartment_number").child_of(user_code).build()?;
        let secret_code = ctx.state("secret_code").child_of(user_code).build()?;
        let service_code = ctx.state("service_code").child_of(special).build()?;
        let _completed = ctx.state("operation_completed").child_of(dialog).build()?;
        let idle = ctx.state("idle").build()?;

        ctx.set_initial_substate(dialog, wait_activity)?;
        ctx.set_initial_substate(special, user_code)?;
        ctx.set_initial_substate(user_code, apartment)?;

        let _ = (number_selection, service_code);
        Ok(ConsoleStates {
            dialog,
            wait_activity,
            secret_code,
            idle,
        })
    }
}

impl Agent for Console {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        let states = Self::build_states(ctx)?;

        ctx.subscribe_self()
            .event_signal::<Console, GoDeep, _>(move |this, ctx| {
                ctx.change_state(states.secret_code).unwrap();
                this.record(ctx);
            })?
            // Cancel must target wait_activity, not dialog: dialog has
            // history and a switch to dialog restores the last active
            // substate instead of resetting the conversation.
            .event_signal::<Console, Cancel, _>(move |this, ctx| {
                ctx.change_state(states.wait_activity).unwrap();
                this.record(ctx);
            })?
            .event_signal::<Console, Reenter, _>(move |this, ctx| {
                ctx.change_state(states.dialog).unwrap();
                this.record(ctx);
            })?
            .event_signal::<Console, Leave, _>(move |this, ctx| {
                ctx.change_state(states.idle).unwrap();
                this.record(ctx);
            })?
            .event_signal::<Console, Probe, _>(move |this, ctx| {
                this.record(ctx);
                ctx.deregister_coop().unwrap();
            })?;

        ctx.change_state(states.dialog)?;
        Ok(())
    }

    fn so_evt_start(&mut self, ctx: &AgentContext) {
        self.record(ctx);
    }
}

#[test]
fn deep_history_restores_the_whole_configuration() {
    let journal = Arc::new(Mutex::new(Vec::new()));

    {
        let journal = Arc::clone(&journal);
        launch(move |env| {
            let mut coop = env.create_coop("console");
            let console = coop.add_agent(Console { journal });
            env.register_coop(coop)?;

            send_signal::<GoDeep>(&console)?;
            send_signal::<Cancel>(&console)?;
            send_signal::<Reenter>(&console)?;
            send_signal::<Leave>(&console)?;
            send_signal::<Reenter>(&console)?;
            send_signal::<Cancel>(&console)?;
            send_signal::<Probe>(&console)
        })
        .expect("environment shuts down normally");
    }

    const SECRET: &str = "dialog.special_code_selection.user_code_selection.secret_code";
    let journal = journal.lock().unwrap();
    assert_eq!(
        *journal,
        vec![
            // evt_start observes the initial descent into the dialog.
            "dialog.wait_activity".to_string(),
            // explicit dive into the nested subtree
            SECRET.to_string(),
            // cancel moves inside dialog without leaving it
            "dialog.wait_activity".to_string(),
            // dialog itself still remembers the whole configuration
            SECRET.to_string(),
            // a full exit of the subtree
            "idle".to_string(),
            // deep history survives the exit as well
            SECRET.to_string(),
            // the history points at secret_code here, yet a transition
            // aimed at wait_activity directly is not redirected by it
            "dialog.wait_activity".to_string(),
            "dialog.wait_activity".to_string(),
        ]
    );
}

struct Limited {
    entered_target: Arc<AtomicUsize>,
}

struct Begin;
struct LeaveEarly;
struct Finish;

impl Agent for Limited {
    fn so_define_agent(&mut self, ctx: &AgentContext) -> Result<()> {
        let working = ctx.state("working").build()?;
        let expired = ctx.state("expired").build()?;
        ctx.set_state_time_limit(working, Duration::from_millis(50), expired)?;

        let counter = Arc::clone(&self.entered_target);
        ctx.on_enter(expired, move |_this: &mut Limited, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;

        ctx.subscribe_self()
            .event_signal::<Limited, Begin, _>(move |_this, ctx| {
                ctx.change_state(working).unwrap();
            })?
            .event_signal::<Limited, LeaveEarly, _>(move |_this, ctx| {
                // Back to the default state before the limit fires.
                ctx.change_state(State::default_state()).unwrap();
            })?
            .event_signal::<Limited, Finish, _>(|_this, ctx| {
                ctx.deregister_coop().unwrap();
            })?;
        Ok(())
    }
}

#[test]
fn state_time_limit_fires_only_while_the_state_is_active() {
    let entered_target = Arc::new(AtomicUsize::new(0));

    {
        let entered_target = Arc::clone(&entered_target);
        launch(move |env| {
            let mut coop = env.create_coop("limited");
            let agent = coop.add_agent(Limited { entered_target });
            env.register_coop(coop)?;

            // First activation is left before the limit elapses.
            send_signal::<Begin>(&agent)?;
            send_signal::<LeaveEarly>(&agent)?;
            std::thread::sleep(Duration::from_millis(120));

            // Second activation runs into the limit.
            send_signal::<Begin>(&agent)?;
            std::thread::sleep(Duration::from_millis(150));
            send_signal::<Finish>(&agent)
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(entered_target.load(Ordering::SeqCst), 1);
}
