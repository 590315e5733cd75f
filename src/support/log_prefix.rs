//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Kvmail.
//
// Kvmail is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Kvmail is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Kvmail. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::sync::{Arc, Mutex};

/// The prefix put in front of log lines about one component of one user's
/// data, e.g. `mailstore[alice]`.
///
/// Clones share state, so setting the user on one clone is visible through
/// all the others.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    component: String,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(component: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                component,
                user: None,
            })),
        }
    }

    pub fn for_user(component: &str, user: &str) -> Self {
        let this = Self::new(component.to_owned());
        this.set_user(user.to_owned());
        this
    }

    /// Produce a prefix for a sub-component that starts out with the same
    /// user but no longer shares state with `self`.
    pub fn deep_clone(&self, component: &str) -> Self {
        let inner = self.inner.lock().unwrap();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                component: component.to_owned(),
                user: inner.user.clone(),
            })),
        }
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(sanitise(user));
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.component)?;
        if let Some(ref user) = inner.user {
            write!(f, "[{user}]")?;
        }

        Ok(())
    }
}

impl fmt::Debug for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LogPrefix({})", self)
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}
