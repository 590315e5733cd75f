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

/// Whether `name` may be used as a user name, which becomes a directory name
/// under the storage root.
pub fn is_safe_user_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        // Block directory traversal through .. and hidden files on UNIX
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains(|c: char| c < ' ' || c == '\x7F')
}
